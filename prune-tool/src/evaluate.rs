//! Detection accuracy evaluation of a backbone.

use crate::{
    common::*,
    config::{EvaluationConfig, HarnessConfig},
};

/// Options for one evaluation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOptions {
    pub dataset_dir: PathBuf,
    /// The directory where detections and the report are written.
    pub output_dir: PathBuf,
    pub max_per_image: usize,
    pub score_threshold: R64,
}

/// Per-class average precision and their mean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub class_ap: IndexMap<String, R64>,
    pub mean_ap: R64,
}

impl EvalReport {
    /// Builds a report whose mean is computed from the class scores.
    pub fn from_class_ap(class_ap: IndexMap<String, R64>) -> Self {
        let mean_ap = if class_ap.is_empty() {
            r64(0.0)
        } else {
            class_ap.values().copied().sum::<R64>() / class_ap.len() as f64
        };
        Self { class_ap, mean_ap }
    }
}

/// Measures the detection accuracy of a backbone.
pub trait Evaluator {
    fn evaluate(&mut self, backbone: &Backbone, options: &EvalOptions) -> Result<EvalReport>;

    /// Returns false if evaluation is skipped.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// An evaluator that is never enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvaluation;

impl Evaluator for NoEvaluation {
    fn evaluate(&mut self, _backbone: &Backbone, _options: &EvalOptions) -> Result<EvalReport> {
        bail!("evaluation is disabled")
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Runs an external program on a saved artifact.
///
/// The program is invoked as
/// `program [args..] --model FILE --dataset-dir DIR --output-dir DIR --max-per-image N --score-threshold T`
/// and must print a json object with `class_ap` and optionally `mean_ap`
/// fields to stdout.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    harness: HarnessConfig,
}

impl CommandEvaluator {
    pub const MODEL_FILE_NAME: &'static str = "model.ot";

    pub fn new(harness: HarnessConfig) -> Self {
        Self { harness }
    }
}

impl Evaluator for CommandEvaluator {
    fn evaluate(&mut self, backbone: &Backbone, options: &EvalOptions) -> Result<EvalReport> {
        let EvalOptions {
            dataset_dir,
            output_dir,
            max_per_image,
            score_threshold,
        } = options;
        let HarnessConfig { program, args } = &self.harness;

        fs::create_dir_all(output_dir)?;
        let model_file = output_dir.join(Self::MODEL_FILE_NAME);
        backbone.save_pruned(&model_file)?;

        debug!(
            "run evaluation harness '{}' on '{}'",
            program.display(),
            model_file.display()
        );
        let output = Command::new(program)
            .args(args)
            .arg("--model")
            .arg(&model_file)
            .arg("--dataset-dir")
            .arg(dataset_dir)
            .arg("--output-dir")
            .arg(output_dir)
            .arg("--max-per-image")
            .arg(max_per_image.to_string())
            .arg("--score-threshold")
            .arg(score_threshold.to_string())
            .output()
            .with_context(|| format!("unable to run '{}'", program.display()))?;

        ensure!(
            output.status.success(),
            "'{}' exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );

        parse_report(&output.stdout)
            .with_context(|| format!("'{}' printed an invalid report", program.display()))
    }
}

/// Builds the evaluator described by the configuration.
pub fn evaluator_from_config(config: &EvaluationConfig) -> Box<dyn Evaluator> {
    match &config.harness {
        Some(harness) => Box::new(CommandEvaluator::new(harness.clone())),
        None => Box::new(NoEvaluation),
    }
}

fn parse_report(stdout: &[u8]) -> Result<EvalReport> {
    #[derive(Deserialize)]
    struct RawReport {
        class_ap: IndexMap<String, R64>,
        mean_ap: Option<R64>,
    }

    let RawReport { class_ap, mean_ap } = serde_json::from_slice(stdout)?;
    ensure!(
        class_ap
            .values()
            .all(|&ap| (0.0..=1.0).contains(&ap.raw())),
        "average precision must be within [0, 1]"
    );

    let report = match mean_ap {
        Some(mean_ap) => EvalReport { class_ap, mean_ap },
        None => EvalReport::from_class_ap(class_ap),
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_report_fills_missing_mean() -> Result<()> {
        let report = parse_report(br#"{"class_ap": {"cat": 0.5, "dog": 0.75}}"#)?;
        assert_eq!(report.class_ap.keys().collect::<Vec<_>>(), ["cat", "dog"]);
        assert_eq!(report.mean_ap, r64(0.625));

        let report = parse_report(br#"{"class_ap": {"cat": 0.5}, "mean_ap": 0.4}"#)?;
        assert_eq!(report.mean_ap, r64(0.4));

        assert!(parse_report(br#"{"class_ap": {"cat": 1.5}}"#).is_err());
        assert!(parse_report(b"mAP = 0.5").is_err());
        Ok(())
    }

    #[test]
    fn missing_harness_disables_evaluation() {
        let evaluator = evaluator_from_config(&EvaluationConfig::default());
        assert!(!evaluator.is_enabled());
    }
}
