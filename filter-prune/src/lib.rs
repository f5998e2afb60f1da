//! Filter-level structural pruning of residual backbones.

mod common;
pub mod error;
pub mod pruner;
pub mod rank;
pub mod ratio;
pub mod rebuild;
pub mod resolve;

pub use error::*;
pub use pruner::*;
pub use rank::*;
pub use ratio::*;
pub use rebuild::*;
pub use resolve::*;
