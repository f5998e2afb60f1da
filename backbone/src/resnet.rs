//! ResNet backbones laid out as flat node sequences.

use crate::{
    activation::Activation,
    backbone::Backbone,
    batch_norm_2d::BatchNorm2DInit,
    block::{BasicBlockInit, BottleneckInit},
    common::*,
    conv_2d::Conv2DInit,
    max_pool_2d::MaxPool2D,
    node::Node,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResNetBlock {
    Basic,
    Bottleneck,
}

/// Builds a ResNet without its classifier.
///
/// The stem takes positions 0 to 3 (conv, norm, activation, pooling),
/// followed by one position per residual block. For `resnet50()` this gives
/// 20 positions with the end of the second stage at 10 and the last block
/// at 19.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResNetInit {
    pub block: ResNetBlock,
    pub layers: [usize; 4],
    pub in_channels: usize,
    pub base_width: usize,
    pub activation: Activation,
    pub bn: BatchNorm2DInit,
}

impl ResNetInit {
    pub fn new(block: ResNetBlock, layers: [usize; 4]) -> Self {
        Self {
            block,
            layers,
            in_channels: 3,
            base_width: 64,
            activation: Activation::Relu,
            bn: Default::default(),
        }
    }

    pub fn resnet18() -> Self {
        Self::new(ResNetBlock::Basic, [2, 2, 2, 2])
    }

    pub fn resnet34() -> Self {
        Self::new(ResNetBlock::Basic, [3, 4, 6, 3])
    }

    pub fn resnet50() -> Self {
        Self::new(ResNetBlock::Bottleneck, [3, 4, 6, 3])
    }

    pub fn resnet101() -> Self {
        Self::new(ResNetBlock::Bottleneck, [3, 4, 23, 3])
    }

    /// Positions of the last block of every stage.
    pub fn stage_ends(&self) -> [usize; 4] {
        let mut end = 3;
        self.layers.map(|num_blocks| {
            end += num_blocks;
            end
        })
    }

    pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<Backbone> {
        let path = path.borrow();
        let Self {
            block,
            layers,
            in_channels,
            base_width,
            activation,
            bn,
        } = self;

        ensure!(
            layers.iter().all(|&num| num > 0),
            "every stage must contain at least one block"
        );

        let mut nodes: Vec<Node> = vec![
            Conv2DInit {
                s: [2, 2],
                bias: false,
                ..Conv2DInit::new(in_channels, base_width, 7)
            }
            .build(path / 0)?
            .into(),
            bn.clone().build(path / 1, base_width).into(),
            activation.into(),
            MaxPool2D::new(3, 2).into(),
        ];

        let mut in_c = base_width;
        for (stage, &num_blocks) in layers.iter().enumerate() {
            let planes = base_width << stage;

            for index in 0..num_blocks {
                let stride = if stage > 0 && index == 0 { 2 } else { 1 };
                let block_path = path / nodes.len();

                let node: Node = match block {
                    ResNetBlock::Basic => BasicBlockInit {
                        activation,
                        bn: bn.clone(),
                        ..BasicBlockInit::new(in_c, planes, stride)
                    }
                    .build(block_path)?
                    .into(),
                    ResNetBlock::Bottleneck => BottleneckInit {
                        activation,
                        bn: bn.clone(),
                        ..BottleneckInit::new(in_c, planes, stride)
                    }
                    .build(block_path)?
                    .into(),
                };

                in_c = node.out_channels().unwrap_or(in_c);
                nodes.push(node);
            }
        }

        Backbone::new(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BlockKind;
    use tch::kind::FLOAT_CPU;

    #[test]
    fn resnet50_layout() -> Result<()> {
        let init = ResNetInit::resnet50();
        assert_eq!(init.stage_ends(), [6, 10, 16, 19]);

        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = init.build(&vs.root())?;
        assert_eq!(backbone.len(), 20);
        assert_eq!(backbone.nodes()[0].block_kind(), BlockKind::PlainConv);
        assert!(backbone.nodes()[1..4]
            .iter()
            .all(|node| node.block_kind() == BlockKind::ChannelPreserving));
        assert!(backbone.nodes()[4..]
            .iter()
            .all(|node| node.block_kind() == BlockKind::Bottleneck));
        assert_eq!(backbone.out_channels_at(10), Some(512));
        assert_eq!(backbone.out_channels_at(19), Some(2048));
        Ok(())
    }

    #[test]
    fn resnet18_forward() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = ResNetInit::resnet18().build(&vs.root())?;
        assert_eq!(backbone.len(), 12);

        let input = Tensor::randn(&[1, 3, 64, 64], FLOAT_CPU);
        let taps = backbone.forward_taps(&input, false, &[7, 11])?;
        assert_eq!(taps[0].size(), [1, 128, 8, 8]);
        assert_eq!(taps[1].size(), [1, 512, 2, 2]);
        Ok(())
    }
}
