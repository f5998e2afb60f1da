use crate::common::*;

/// The nonlinearity applied after a normalization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    /// Leaky ReLU with negative slope 0.1.
    Leaky,
    Swish,
    Identity,
}

impl Default for Activation {
    fn default() -> Self {
        Self::Relu
    }
}

impl Activation {
    pub fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Self::Relu => xs.relu(),
            Self::Leaky => xs.maximum(&(xs * 0.1)),
            Self::Swish => xs * xs.sigmoid(),
            Self::Identity => xs.shallow_clone(),
        }
    }
}
