use thiserror::Error;

/// Failures of the pruning engine.
#[derive(Debug, Error)]
pub enum PruneError {
    /// The removal set is empty, out of range or covers every channel.
    /// Nothing is installed.
    #[error("invalid prune target: {0}")]
    InvalidPruneTarget(String),

    #[error("position {position} holds a '{kind}' node, which matches no prunable pattern")]
    UnsupportedBlockKind { position: usize, kind: String },

    #[error("position {position} is a fork point and must keep its channel count")]
    ForkPointProtected { position: usize },

    /// The staged layers disagree on a channel count. Nothing is installed.
    #[error("channel mismatch at {layer}: expect {expect} channels, but get {actual}")]
    ChannelMismatch {
        layer: String,
        expect: usize,
        actual: usize,
    },

    #[error(transparent)]
    Tensor(#[from] tch::TchError),
}

impl PruneError {
    /// Returns true if the error must abort a pruning run.
    ///
    /// Other errors reject one operation and leave the backbone untouched.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::UnsupportedBlockKind { .. } | Self::ForkPointProtected { .. } | Self::Tensor(_) => {
                true
            }
            Self::InvalidPruneTarget(_) | Self::ChannelMismatch { .. } => false,
        }
    }
}
