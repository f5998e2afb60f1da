//! The single-pass pruning loop.

use crate::{
    common::*,
    config::Config,
    evaluate::{EvalOptions, EvalReport, Evaluator},
};

/// A prune operation that was rejected and left its block unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPrune {
    pub position: usize,
    pub kind: BlockKind,
    pub reason: String,
}

/// The result of a complete pruning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneOutcome {
    pub baseline: Option<EvalReport>,
    pub pruned: Option<EvalReport>,
    pub reports: Vec<PruneReport>,
    pub rejected: Vec<RejectedPrune>,
    /// The saved pruned model.
    pub artifact: PathBuf,
}

impl PruneOutcome {
    pub fn num_removed(&self) -> usize {
        self.reports.iter().map(PruneReport::num_removed).sum()
    }
}

/// Evaluates, prunes, re-evaluates and saves a backbone.
pub struct PruneDriver {
    config: Config,
    pruner: BlockPruner,
    evaluator: Box<dyn Evaluator>,
}

impl PruneDriver {
    pub const ARTIFACT_FILE_NAME: &'static str = "resnet_ssd_pruned.ot";
    pub const REPORT_FILE_NAME: &'static str = "prune_report.json";

    pub fn new(config: Config, evaluator: Box<dyn Evaluator>) -> Self {
        let pruner = BlockPruner::new(
            FilterRanker::new(config.cut_ratio),
            config.fork_points.iter().copied(),
        );
        Self {
            config,
            pruner,
            evaluator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the pruning pass on `backbone`.
    ///
    /// On a fatal error the backbone keeps every block pruned before the
    /// failure, and nothing is saved.
    pub fn run(&mut self, backbone: &mut Backbone) -> Result<PruneOutcome> {
        let device = self.config.device;
        check_device(device)?;
        check_fork_points(backbone, &self.config.fork_points)?;
        fs::create_dir_all(&self.config.prune_dir).with_context(|| {
            format!(
                "unable to create directory '{}'",
                self.config.prune_dir.display()
            )
        })?;

        *backbone = backbone.to_device(device);
        let baseline = self.evaluate(backbone, "baseline");

        // layers are rebuilt on CPU
        *backbone = backbone.to_device(Device::Cpu);
        let (reports, rejected) = self.prune_pass(backbone)?;
        backbone
            .check_connectivity()
            .context("the pruned backbone is inconsistent")?;

        *backbone = backbone.to_device(device);
        let pruned = self.evaluate(backbone, "pruned");

        let artifact = self.config.prune_dir.join(Self::ARTIFACT_FILE_NAME);
        backbone.save_pruned(&artifact)?;
        info!("saved pruned model to '{}'", artifact.display());

        let outcome = PruneOutcome {
            baseline,
            pruned,
            reports,
            rejected,
            artifact,
        };

        let report_file = self.config.prune_dir.join(Self::REPORT_FILE_NAME);
        fs::write(&report_file, serde_json::to_string_pretty(&outcome)?)
            .with_context(|| format!("unable to write '{}'", report_file.display()))?;

        Ok(outcome)
    }

    fn prune_pass(
        &self,
        backbone: &mut Backbone,
    ) -> Result<(Vec<PruneReport>, Vec<RejectedPrune>)> {
        let mut reports = vec![];
        let mut rejected = vec![];

        for position in 0..backbone.len() {
            let kind = backbone.nodes()[position].block_kind();

            if self.pruner.is_fork_point(position) {
                debug!("skip fork point at {}", position);
                continue;
            }
            if kind == BlockKind::ChannelPreserving {
                continue;
            }

            match self.pruner.prune_position(backbone, position) {
                Ok(report) => {
                    info!(
                        "{} at {}: removed {} filters",
                        kind,
                        position,
                        report.num_removed()
                    );
                    reports.push(report);
                }
                Err(err) if !err.is_fatal() => {
                    warn!("skip {} at {}: {}", kind, position, err);
                    rejected.push(RejectedPrune {
                        position,
                        kind,
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("pruning aborted at position {}", position));
                }
            }
        }

        Ok((reports, rejected))
    }

    /// Evaluation failures are logged and do not stop the run.
    fn evaluate(&mut self, backbone: &Backbone, stage: &str) -> Option<EvalReport> {
        if !self.evaluator.is_enabled() {
            debug!("evaluation is disabled, skip the {} evaluation", stage);
            return None;
        }

        let Config {
            prune_dir,
            dataset_dir,
            evaluation,
            ..
        } = &self.config;
        let options = EvalOptions {
            dataset_dir: dataset_dir.clone(),
            output_dir: prune_dir.join(&evaluation.output_dir).join(stage),
            max_per_image: evaluation.max_per_image,
            score_threshold: evaluation.score_threshold,
        };

        match self.evaluator.evaluate(backbone, &options) {
            Ok(report) => {
                info!("{} mAP = {:.4}", stage, report.mean_ap);
                for (class, ap) in &report.class_ap {
                    debug!("{} AP for {} = {:.4}", stage, class, ap);
                }
                Some(report)
            }
            Err(err) => {
                warn!("{} evaluation failed: {:#}", stage, err);
                None
            }
        }
    }
}

fn check_device(device: Device) -> Result<()> {
    if let Device::Cuda(index) = device {
        ensure!(Cuda::is_available(), "CUDA is not available");
        let count = Cuda::device_count() as usize;
        ensure!(
            index < count,
            "CUDA device {} is requested, but only {} devices are present",
            index,
            count
        );
    }
    Ok(())
}

fn check_fork_points(backbone: &Backbone, fork_points: &[usize]) -> Result<()> {
    let invalid: Vec<_> = fork_points
        .iter()
        .filter(|&&position| position >= backbone.len())
        .collect();
    ensure!(
        invalid.is_empty(),
        "fork points {:?} are out of range for a backbone with {} nodes",
        invalid,
        backbone.len()
    );
    Ok(())
}
