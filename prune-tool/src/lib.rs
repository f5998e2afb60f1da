//! The pruning program for a ResNet SSD backbone.

mod common;
pub mod config;
pub mod driver;
pub mod evaluate;
pub mod model;

use crate::common::*;
pub use config::Config;
pub use driver::{PruneDriver, PruneOutcome, RejectedPrune};
pub use evaluate::{EvalOptions, EvalReport, Evaluator};

/// The entry of pruning program.
pub fn start(config: Config) -> Result<PruneOutcome> {
    let mut backbone = model::load_backbone(&config.model)?;
    let evaluator = evaluate::evaluator_from_config(&config.evaluation);
    let mut driver = PruneDriver::new(config, evaluator);
    driver.run(&mut backbone)
}
