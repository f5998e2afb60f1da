//! Finds the layers that must shrink together with a producer convolution.

use crate::common::*;

/// A layer that reads the output of a pruned producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consumer {
    /// A convolution whose input channels shrink with the producer.
    Conv(LayerRef),
    /// A reader whose width cannot change, such as an identity skip or the
    /// end of the backbone.
    Fixed { name: String, channels: usize },
}

/// A producer convolution together with every layer tied to its output width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Junction {
    pub producer: LayerRef,
    /// Normalization layers between the producer and its consumers.
    pub norms: Vec<LayerRef>,
    pub consumers: Vec<Consumer>,
}

/// Resolves junctions on a backbone while protecting fork points.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    backbone: &'a Backbone,
    fork_points: &'a BTreeSet<usize>,
}

impl<'a> Resolver<'a> {
    pub fn new(backbone: &'a Backbone, fork_points: &'a BTreeSet<usize>) -> Self {
        Self {
            backbone,
            fork_points,
        }
    }

    fn node(&self, position: usize, expect: BlockKind) -> PruneResult<&'a Node> {
        if self.fork_points.contains(&position) {
            return Err(PruneError::ForkPointProtected { position });
        }
        let node = self.backbone.node(position).ok_or_else(|| {
            PruneError::InvalidPruneTarget(format!(
                "position {} is out of range 0..{}",
                position,
                self.backbone.len()
            ))
        })?;
        if node.block_kind() != expect {
            return Err(PruneError::UnsupportedBlockKind {
                position,
                kind: node.kind().as_ref().to_string(),
            });
        }
        Ok(node)
    }

    /// The junction of a plain convolution.
    ///
    /// Normalization, activation and pooling nodes after the convolution are
    /// walked over. The walk stops at the next convolution, or at the next
    /// residual block, where both the residual branch and the projection skip
    /// read the pruned channels.
    pub fn plain_conv(&self, position: usize) -> PruneResult<Junction> {
        let producer = self.node(position, BlockKind::PlainConv)?;
        let out_c = producer.out_channels().unwrap_or(0);

        let mut norms = vec![];
        for next in (position + 1)..self.backbone.len() {
            let node = &self.backbone.nodes()[next];

            let consumers = match node {
                Node::BatchNorm2D(_) | Node::Activation(_) | Node::MaxPool2D(_) => {
                    if self.fork_points.contains(&next) {
                        return Err(PruneError::ForkPointProtected { position: next });
                    }
                    if let Node::BatchNorm2D(_) = node {
                        norms.push(LayerRef::node(next));
                    }
                    continue;
                }
                Node::Conv2D(_) => vec![Consumer::Conv(LayerRef::node(next))],
                Node::BasicBlock(block) if block.downsample().is_some() => vec![
                    Consumer::Conv(LayerRef::block(next, Slot::Conv1)),
                    Consumer::Conv(LayerRef::block(next, Slot::DownsampleConv)),
                ],
                Node::Bottleneck(block) if block.downsample().is_some() => vec![
                    Consumer::Conv(LayerRef::block(next, Slot::Conv1)),
                    Consumer::Conv(LayerRef::block(next, Slot::DownsampleConv)),
                ],
                Node::BasicBlock(block) => vec![Consumer::Fixed {
                    name: format!("identity skip of the block at {}", next),
                    channels: block.in_channels(),
                }],
                Node::Bottleneck(block) => vec![Consumer::Fixed {
                    name: format!("identity skip of the block at {}", next),
                    channels: block.in_channels(),
                }],
                Node::Opaque(opaque) => vec![Consumer::Fixed {
                    name: format!("'{}' at {}", opaque.name, next),
                    channels: opaque.channels,
                }],
            };

            return Ok(Junction {
                producer: LayerRef::node(position),
                norms,
                consumers,
            });
        }

        Ok(Junction {
            producer: LayerRef::node(position),
            norms,
            consumers: vec![Consumer::Fixed {
                name: "backbone output".into(),
                channels: out_c,
            }],
        })
    }

    /// The junction inside the residual branch of a basic block.
    pub fn basic_block(&self, position: usize) -> PruneResult<Junction> {
        self.node(position, BlockKind::BasicBlock)?;
        Ok(inner_junction(position, Slot::Conv1, Slot::Bn1, Slot::Conv2))
    }

    /// The two junctions inside the residual branch of a bottleneck block,
    /// in the order they are pruned.
    pub fn bottleneck(&self, position: usize) -> PruneResult<[Junction; 2]> {
        self.node(position, BlockKind::Bottleneck)?;
        Ok([
            inner_junction(position, Slot::Conv1, Slot::Bn1, Slot::Conv2),
            inner_junction(position, Slot::Conv2, Slot::Bn2, Slot::Conv3),
        ])
    }
}

fn inner_junction(position: usize, producer: Slot, norm: Slot, consumer: Slot) -> Junction {
    Junction {
        producer: LayerRef::block(position, producer),
        norms: vec![LayerRef::block(position, norm)],
        consumers: vec![Consumer::Conv(LayerRef::block(position, consumer))],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backbone::{Activation, BasicBlockInit, BatchNorm2DInit, Conv2DInit, MaxPool2D};
    use tch::nn;

    #[test]
    fn plain_conv_walks_to_projected_block() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let backbone = Backbone::new(vec![
            Conv2DInit::new(3, 16, 3).build(&root / 0)?.into(),
            BatchNorm2DInit::default().build(&root / 1, 16).into(),
            Activation::Relu.into(),
            MaxPool2D::new(3, 2).into(),
            BasicBlockInit::new(16, 32, 2).build(&root / 4)?.into(),
        ])?;

        let fork_points = BTreeSet::new();
        let junction = Resolver::new(&backbone, &fork_points).plain_conv(0)?;
        assert_eq!(junction.producer, LayerRef::node(0));
        assert_eq!(junction.norms, [LayerRef::node(1)]);
        assert_eq!(
            junction.consumers,
            [
                Consumer::Conv(LayerRef::block(4, Slot::Conv1)),
                Consumer::Conv(LayerRef::block(4, Slot::DownsampleConv)),
            ]
        );

        let fork_points: BTreeSet<_> = [2].into_iter().collect();
        assert!(matches!(
            Resolver::new(&backbone, &fork_points).plain_conv(0),
            Err(PruneError::ForkPointProtected { position: 2 })
        ));
        Ok(())
    }

    #[test]
    fn identity_skip_is_a_fixed_consumer() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let backbone = Backbone::new(vec![
            Conv2DInit::new(3, 16, 3).build(&root / 0)?.into(),
            BasicBlockInit::new(16, 16, 1).build(&root / 1)?.into(),
        ])?;

        let fork_points = BTreeSet::new();
        let resolver = Resolver::new(&backbone, &fork_points);
        let junction = resolver.plain_conv(0)?;
        assert!(matches!(
            junction.consumers.as_slice(),
            [Consumer::Fixed { channels: 16, .. }]
        ));

        assert!(matches!(
            resolver.plain_conv(1),
            Err(PruneError::UnsupportedBlockKind { position: 1, .. })
        ));
        assert!(matches!(
            resolver.basic_block(5),
            Err(PruneError::InvalidPruneTarget(_))
        ));
        Ok(())
    }
}
