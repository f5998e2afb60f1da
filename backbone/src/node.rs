use crate::{
    activation::Activation,
    batch_norm_2d::BatchNorm2D,
    block::{BasicBlock, Bottleneck},
    common::*,
    conv_2d::Conv2D,
    max_pool_2d::{MaxPool2D, Opaque},
};

pub use layer_ref::*;
pub use node_::*;

mod node_ {
    use super::*;

    /// An entry of the backbone sequence.
    #[derive(Debug, AsRefStr)]
    pub enum Node {
        Conv2D(Conv2D),
        BatchNorm2D(BatchNorm2D),
        Activation(Activation),
        MaxPool2D(MaxPool2D),
        BasicBlock(Box<BasicBlock>),
        Bottleneck(Box<Bottleneck>),
        Opaque(Opaque),
    }

    /// The kind tag of a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum NodeKind {
        PlainConv,
        Normalization,
        Activation,
        Pooling,
        BasicBlock,
        Bottleneck,
        Other,
    }

    impl NodeKind {
        pub fn block_kind(&self) -> BlockKind {
            match self {
                Self::PlainConv => BlockKind::PlainConv,
                Self::BasicBlock => BlockKind::BasicBlock,
                Self::Bottleneck => BlockKind::Bottleneck,
                Self::Normalization | Self::Activation | Self::Pooling => {
                    BlockKind::ChannelPreserving
                }
                Self::Other => BlockKind::Other,
            }
        }
    }

    /// The structural pattern of a node as seen by the pruning engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum BlockKind {
        PlainConv,
        BasicBlock,
        Bottleneck,
        /// Normalization, activation and pooling nodes. They follow the width
        /// of their producer and have no filters of their own.
        ChannelPreserving,
        Other,
    }

    impl Display for BlockKind {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_ref())
        }
    }

    impl From<Conv2D> for Node {
        fn from(v: Conv2D) -> Self {
            Self::Conv2D(v)
        }
    }

    impl From<BatchNorm2D> for Node {
        fn from(v: BatchNorm2D) -> Self {
            Self::BatchNorm2D(v)
        }
    }

    impl From<Activation> for Node {
        fn from(v: Activation) -> Self {
            Self::Activation(v)
        }
    }

    impl From<MaxPool2D> for Node {
        fn from(v: MaxPool2D) -> Self {
            Self::MaxPool2D(v)
        }
    }

    impl From<BasicBlock> for Node {
        fn from(v: BasicBlock) -> Self {
            Self::BasicBlock(Box::new(v))
        }
    }

    impl From<Bottleneck> for Node {
        fn from(v: Bottleneck) -> Self {
            Self::Bottleneck(Box::new(v))
        }
    }

    impl From<Opaque> for Node {
        fn from(v: Opaque) -> Self {
            Self::Opaque(v)
        }
    }

    impl Node {
        pub fn kind(&self) -> NodeKind {
            match self {
                Self::Conv2D(_) => NodeKind::PlainConv,
                Self::BatchNorm2D(_) => NodeKind::Normalization,
                Self::Activation(_) => NodeKind::Activation,
                Self::MaxPool2D(_) => NodeKind::Pooling,
                Self::BasicBlock(_) => NodeKind::BasicBlock,
                Self::Bottleneck(_) => NodeKind::Bottleneck,
                Self::Opaque(_) => NodeKind::Other,
            }
        }

        pub fn block_kind(&self) -> BlockKind {
            self.kind().block_kind()
        }

        /// The number of channels this node consumes, if it constrains it.
        pub fn in_channels(&self) -> Option<usize> {
            match self {
                Self::Conv2D(conv) => Some(conv.in_channels()),
                Self::BatchNorm2D(bn) => Some(bn.channels()),
                Self::BasicBlock(block) => Some(block.in_channels()),
                Self::Bottleneck(block) => Some(block.in_channels()),
                Self::Opaque(opaque) => Some(opaque.channels),
                Self::Activation(_) | Self::MaxPool2D(_) => None,
            }
        }

        /// The number of channels this node produces, if it determines it.
        pub fn out_channels(&self) -> Option<usize> {
            match self {
                Self::Conv2D(conv) => Some(conv.out_channels()),
                Self::BasicBlock(block) => Some(block.out_channels()),
                Self::Bottleneck(block) => Some(block.out_channels()),
                Self::BatchNorm2D(bn) => Some(bn.channels()),
                Self::Opaque(opaque) => Some(opaque.channels),
                Self::Activation(_) | Self::MaxPool2D(_) => None,
            }
        }

        pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
            let output = match self {
                Self::Conv2D(conv) => conv.forward(xs),
                Self::BatchNorm2D(bn) => bn.forward_t(xs, train),
                Self::Activation(act) => act.forward(xs),
                Self::MaxPool2D(pool) => pool.forward(xs),
                Self::BasicBlock(block) => block.forward_t(xs, train),
                Self::Bottleneck(block) => block.forward_t(xs, train),
                Self::Opaque(opaque) => opaque.forward(xs)?,
            };
            Ok(output)
        }

        pub fn conv(&self, slot: Slot) -> Option<&Conv2D> {
            match (self, slot) {
                (Self::Conv2D(conv), Slot::Node) => Some(conv),
                (Self::BasicBlock(block), slot) => block.conv(slot),
                (Self::Bottleneck(block), slot) => block.conv(slot),
                _ => None,
            }
        }

        pub fn conv_mut(&mut self, slot: Slot) -> Option<&mut Conv2D> {
            match (self, slot) {
                (Self::Conv2D(conv), Slot::Node) => Some(conv),
                (Self::BasicBlock(block), slot) => block.conv_mut(slot),
                (Self::Bottleneck(block), slot) => block.conv_mut(slot),
                _ => None,
            }
        }

        pub fn norm(&self, slot: Slot) -> Option<&BatchNorm2D> {
            match (self, slot) {
                (Self::BatchNorm2D(bn), Slot::Node) => Some(bn),
                (Self::BasicBlock(block), slot) => block.norm(slot),
                (Self::Bottleneck(block), slot) => block.norm(slot),
                _ => None,
            }
        }

        pub fn norm_mut(&mut self, slot: Slot) -> Option<&mut BatchNorm2D> {
            match (self, slot) {
                (Self::BatchNorm2D(bn), Slot::Node) => Some(bn),
                (Self::BasicBlock(block), slot) => block.norm_mut(slot),
                (Self::Bottleneck(block), slot) => block.norm_mut(slot),
                _ => None,
            }
        }

        pub fn shallow_clone(&self) -> Self {
            match self {
                Self::Conv2D(conv) => Self::Conv2D(conv.shallow_clone()),
                Self::BatchNorm2D(bn) => Self::BatchNorm2D(bn.shallow_clone()),
                Self::Activation(act) => Self::Activation(*act),
                Self::MaxPool2D(pool) => Self::MaxPool2D(*pool),
                Self::BasicBlock(block) => Self::BasicBlock(Box::new(block.shallow_clone())),
                Self::Bottleneck(block) => Self::Bottleneck(Box::new(block.shallow_clone())),
                Self::Opaque(opaque) => Self::Opaque(opaque.clone()),
            }
        }

        pub fn to_device(&self, device: Device) -> Self {
            match self {
                Self::Conv2D(conv) => Self::Conv2D(conv.to_device(device)),
                Self::BatchNorm2D(bn) => Self::BatchNorm2D(bn.to_device(device)),
                Self::BasicBlock(block) => Self::BasicBlock(Box::new(block.to_device(device))),
                Self::Bottleneck(block) => Self::Bottleneck(Box::new(block.to_device(device))),
                Self::Activation(_) | Self::MaxPool2D(_) | Self::Opaque(_) => self.shallow_clone(),
            }
        }
    }
}

mod layer_ref {
    use super::*;

    /// Addresses a layer inside a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Slot {
        /// The node itself, for plain convolution and normalization nodes.
        Node,
        Conv1,
        Bn1,
        Conv2,
        Bn2,
        Conv3,
        Bn3,
        DownsampleConv,
        DownsampleBn,
    }

    impl Slot {
        pub const ALL: [Slot; 9] = [
            Self::Node,
            Self::Conv1,
            Self::Bn1,
            Self::Conv2,
            Self::Bn2,
            Self::Conv3,
            Self::Bn3,
            Self::DownsampleConv,
            Self::DownsampleBn,
        ];

        /// The parameter path of the slot relative to its node.
        pub fn key(&self) -> Option<&'static str> {
            let key = match self {
                Self::Node => return None,
                Self::Conv1 => "conv1",
                Self::Bn1 => "bn1",
                Self::Conv2 => "conv2",
                Self::Bn2 => "bn2",
                Self::Conv3 => "conv3",
                Self::Bn3 => "bn3",
                Self::DownsampleConv => "downsample.0",
                Self::DownsampleBn => "downsample.1",
            };
            Some(key)
        }
    }

    /// The position of a layer in the backbone.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    pub struct LayerRef {
        pub position: usize,
        pub slot: Slot,
    }

    impl LayerRef {
        pub fn node(position: usize) -> Self {
            Self {
                position,
                slot: Slot::Node,
            }
        }

        pub fn block(position: usize, slot: Slot) -> Self {
            Self { position, slot }
        }
    }

    impl Display for LayerRef {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            match self.slot.key() {
                Some(key) => write!(f, "{}.{}", self.position, key),
                None => write!(f, "{}", self.position),
            }
        }
    }
}
