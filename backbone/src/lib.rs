//! Residual backbone graph built on `tch` tensors.

pub mod activation;
pub mod artifact;
pub mod backbone;
pub mod batch_norm_2d;
pub mod block;
mod common;
pub mod config;
pub mod conv_2d;
pub mod max_pool_2d;
pub mod node;
pub mod params;
pub mod resnet;

pub use activation::*;
pub use artifact::*;
pub use backbone::*;
pub use batch_norm_2d::*;
pub use block::*;
pub use config::*;
pub use conv_2d::*;
pub use max_pool_2d::*;
pub use node::*;
pub use params::*;
pub use resnet::*;
