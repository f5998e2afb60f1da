use anyhow::{Context, Result};
use prune_tool::config::Config;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
/// Prune filters of a ResNet SSD backbone
struct Args {
    #[structopt(long, default_value = "prune.json5")]
    /// configuration file
    pub config_file: PathBuf,
}

pub fn main() -> Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_default())
        .init();

    let Args { config_file } = Args::from_args();
    let config = Config::open(&config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;

    let outcome = prune_tool::start(config)?;

    log::info!(
        "removed {} filters in {} blocks, {} blocks rejected",
        outcome.num_removed(),
        outcome.reports.len(),
        outcome.rejected.len()
    );
    if let (Some(baseline), Some(pruned)) = (&outcome.baseline, &outcome.pruned) {
        log::info!("mAP {:.4} -> {:.4}", baseline.mean_ap, pruned.mean_ap);
    }

    Ok(())
}
