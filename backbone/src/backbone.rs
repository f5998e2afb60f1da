use crate::{
    batch_norm_2d::BatchNorm2D,
    common::*,
    conv_2d::Conv2D,
    node::{LayerRef, Node},
};

/// A residual backbone stored as a sequence of nodes in feed-forward order.
#[derive(Debug)]
pub struct Backbone {
    nodes: Vec<Node>,
}

impl Backbone {
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        let backbone = Self { nodes };
        backbone.check_connectivity()?;
        Ok(backbone)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, position: usize) -> Option<&Node> {
        self.nodes.get(position)
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    /// Swaps the node at `position` and returns the previous one.
    pub fn replace(&mut self, position: usize, node: Node) -> Result<Node> {
        let len = self.nodes.len();
        let slot = self
            .nodes
            .get_mut(position)
            .ok_or_else(|| format_err!("position {} is out of range 0..{}", position, len))?;
        Ok(mem::replace(slot, node))
    }

    pub fn conv(&self, layer: LayerRef) -> Option<&Conv2D> {
        self.nodes.get(layer.position)?.conv(layer.slot)
    }

    pub fn norm(&self, layer: LayerRef) -> Option<&BatchNorm2D> {
        self.nodes.get(layer.position)?.norm(layer.slot)
    }

    /// Replaces the convolution at `layer` and returns the previous one.
    pub fn set_conv(&mut self, layer: LayerRef, conv: Conv2D) -> Result<Conv2D> {
        let target = self
            .nodes
            .get_mut(layer.position)
            .and_then(|node| node.conv_mut(layer.slot))
            .ok_or_else(|| format_err!("no convolution at {}", layer))?;
        Ok(mem::replace(target, conv))
    }

    /// Replaces the normalization at `layer` and returns the previous one.
    pub fn set_norm(&mut self, layer: LayerRef, norm: BatchNorm2D) -> Result<BatchNorm2D> {
        let target = self
            .nodes
            .get_mut(layer.position)
            .and_then(|node| node.norm_mut(layer.slot))
            .ok_or_else(|| format_err!("no normalization at {}", layer))?;
        Ok(mem::replace(target, norm))
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.nodes
            .iter()
            .try_fold(xs.shallow_clone(), |xs, node| node.forward_t(&xs, train))
    }

    /// Runs the whole sequence and returns the feature maps leaving the
    /// `taps` positions, in the order given.
    pub fn forward_taps(&self, xs: &Tensor, train: bool, taps: &[usize]) -> Result<Vec<Tensor>> {
        if let Some(&tap) = taps.iter().find(|&&tap| tap >= self.nodes.len()) {
            bail!("tap {} is out of range 0..{}", tap, self.nodes.len());
        }

        let mut outputs: HashMap<usize, Tensor> = HashMap::new();
        let mut xs = xs.shallow_clone();
        for (position, node) in self.nodes.iter().enumerate() {
            xs = node.forward_t(&xs, train)?;
            if taps.contains(&position) {
                outputs.insert(position, xs.shallow_clone());
            }
        }

        let features = taps
            .iter()
            .map(|tap| outputs[tap].shallow_clone())
            .collect();
        Ok(features)
    }

    /// The width of the feature map leaving `position`.
    ///
    /// Returns `None` if neither the node nor any node before it
    /// determines the width.
    pub fn out_channels_at(&self, position: usize) -> Option<usize> {
        self.nodes
            .get(..=position)?
            .iter()
            .rev()
            .find_map(|node| node.out_channels())
    }

    /// Verifies that every producer agrees with its consumer on the channel
    /// count, including the layers inside residual blocks.
    pub fn check_connectivity(&self) -> Result<()> {
        let mut width: Option<usize> = None;

        for (position, node) in self.nodes.iter().enumerate() {
            match node {
                Node::BasicBlock(block) => block
                    .check()
                    .with_context(|| format!("block at position {} is broken", position))?,
                Node::Bottleneck(block) => block
                    .check()
                    .with_context(|| format!("block at position {} is broken", position))?,
                _ => {}
            }

            if let (Some(expect), Some(actual)) = (width, node.in_channels()) {
                ensure!(
                    expect == actual,
                    "position {} ({}) expects {} input channels, but the preceding node produces {}",
                    position,
                    node.as_ref(),
                    actual,
                    expect
                );
            }

            if let Some(out_c) = node.out_channels() {
                width = Some(out_c);
            }
        }

        Ok(())
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            nodes: self.nodes.iter().map(|node| node.to_device(device)).collect(),
        }
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            nodes: self.nodes.iter().map(Node::shallow_clone).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        activation::Activation,
        batch_norm_2d::BatchNorm2DInit,
        conv_2d::Conv2DInit,
        max_pool_2d::Opaque,
    };
    use tch::kind::FLOAT_CPU;

    fn plain_backbone(vs: &nn::VarStore) -> Result<Backbone> {
        let root = vs.root();
        Backbone::new(vec![
            Conv2DInit::new(3, 16, 3).build(&root / 0)?.into(),
            BatchNorm2DInit::default().build(&root / 1, 16).into(),
            Activation::Relu.into(),
            Conv2DInit::new(16, 32, 3).build(&root / 3)?.into(),
        ])
    }

    #[test]
    fn connectivity_detects_width_disagreement() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let result = Backbone::new(vec![
            Conv2DInit::new(3, 16, 3).build(&root / 0)?.into(),
            BatchNorm2DInit::default().build(&root / 1, 12).into(),
        ]);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn out_channels_looks_through_channel_agnostic_nodes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = plain_backbone(&vs)?;
        assert_eq!(backbone.out_channels_at(2), Some(16));
        assert_eq!(backbone.out_channels_at(3), Some(32));
        assert_eq!(backbone.out_channels_at(4), None);
        Ok(())
    }

    #[test]
    fn replace_and_set_keep_neighbours() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut backbone = plain_backbone(&vs)?;

        let old = backbone.replace(2, Activation::Leaky.into())?;
        assert!(matches!(old, Node::Activation(Activation::Relu)));
        assert!(backbone.replace(4, Activation::Relu.into()).is_err());

        let conv = Conv2DInit::new(16, 8, 1).build(&vs.root() / "swap")?;
        backbone.set_conv(LayerRef::node(3), conv)?;
        assert_eq!(backbone.out_channels_at(3), Some(8));
        let norm = BatchNorm2DInit::default().build(&vs.root() / "bad", 16);
        assert!(backbone.set_norm(LayerRef::node(0), norm).is_err());
        backbone.check_connectivity()?;
        Ok(())
    }

    #[test]
    fn forward_taps_follow_requested_order() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = plain_backbone(&vs)?;
        let input = Tensor::randn(&[1, 3, 8, 8], FLOAT_CPU);

        let taps = backbone.forward_taps(&input, false, &[3, 1])?;
        assert_eq!(taps[0].size(), [1, 32, 8, 8]);
        assert_eq!(taps[1].size(), [1, 16, 8, 8]);

        let output = backbone.forward_t(&input, false)?;
        assert!(output.equal(&taps[0]));
        assert!(backbone.forward_taps(&input, false, &[7]).is_err());
        Ok(())
    }

    #[test]
    fn opaque_node_checks_width() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let result = Backbone::new(vec![
            Conv2DInit::new(3, 16, 3).build(&root / 0)?.into(),
            Opaque {
                name: "l2norm".into(),
                channels: 8,
            }
            .into(),
        ]);
        assert!(result.is_err());
        Ok(())
    }
}
