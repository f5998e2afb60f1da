//! Serializable architecture description of a backbone.

use crate::{
    activation::Activation,
    backbone::Backbone,
    batch_norm_2d::BatchNorm2DInit,
    block::{BasicBlockInit, BottleneckInit},
    common::*,
    conv_2d::Conv2DInit,
    max_pool_2d::{MaxPool2D, Opaque},
    node::Node,
};

/// The hyperparameters and channel counts of every node in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NodeConfig {
    Conv2D(Conv2DInit),
    BatchNorm2D {
        channels: usize,
        bn: BatchNorm2DInit,
    },
    Activation {
        activation: Activation,
    },
    MaxPool2D(MaxPool2D),
    BasicBlock(BasicBlockInit),
    Bottleneck(BottleneckInit),
    Opaque(Opaque),
}

impl NodeConfig {
    pub fn build<'p>(&self, path: impl Borrow<nn::Path<'p>>) -> Result<Node> {
        let path = path.borrow();
        let node: Node = match self {
            Self::Conv2D(init) => init.clone().build(path)?.into(),
            Self::BatchNorm2D { channels, bn } => bn.clone().build(path, *channels).into(),
            Self::Activation { activation } => (*activation).into(),
            Self::MaxPool2D(pool) => (*pool).into(),
            Self::BasicBlock(init) => init.clone().build(path)?.into(),
            Self::Bottleneck(init) => init.clone().build(path)?.into(),
            Self::Opaque(opaque) => opaque.clone().into(),
        };
        Ok(node)
    }
}

impl From<&Node> for NodeConfig {
    fn from(node: &Node) -> Self {
        match node {
            Node::Conv2D(conv) => Self::Conv2D(conv.init()),
            Node::BatchNorm2D(bn) => Self::BatchNorm2D {
                channels: bn.channels(),
                bn: bn.init(),
            },
            Node::Activation(activation) => Self::Activation {
                activation: *activation,
            },
            Node::MaxPool2D(pool) => Self::MaxPool2D(*pool),
            Node::BasicBlock(block) => Self::BasicBlock(block.init()),
            Node::Bottleneck(block) => Self::Bottleneck(block.init()),
            Node::Opaque(opaque) => Self::Opaque(opaque.clone()),
        }
    }
}

impl BackboneConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read '{}'", path.display()))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Backbone {
    pub fn config(&self) -> BackboneConfig {
        BackboneConfig {
            nodes: self.nodes().iter().map(NodeConfig::from).collect(),
        }
    }

    /// Builds a freshly initialized backbone with the described architecture.
    pub fn from_config<'p>(path: impl Borrow<nn::Path<'p>>, config: &BackboneConfig) -> Result<Self> {
        let path = path.borrow();
        let nodes: Vec<_> = config
            .nodes
            .iter()
            .enumerate()
            .map(|(position, node)| {
                node.build(path / position)
                    .with_context(|| format!("unable to build node at position {}", position))
            })
            .try_collect()?;
        Backbone::new(nodes)
    }
}
