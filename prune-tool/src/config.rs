//! Pruning program configuration format.

use crate::common::*;

pub use evaluation::*;
pub use model::*;

/// The main pruning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The directory where the pruned model and reports are written.
    pub prune_dir: PathBuf,
    pub model: ModelSource,
    /// The dataset root passed to the evaluation harness.
    pub dataset_dir: PathBuf,
    /// The fraction of filters removed from each pruned layer.
    #[serde(default)]
    pub cut_ratio: CutRatio,
    /// The device where evaluation runs. Pruning always runs on CPU.
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    /// Backbone positions tapped by the detection head. Their width never changes.
    #[serde(default = "default_fork_points")]
    pub fork_points: Vec<usize>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        ensure!(
            self.fork_points.iter().all_unique(),
            "fork_points must not contain duplicates"
        );
        Ok(())
    }
}

mod model {
    use super::*;

    /// Where the backbone to prune comes from.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "kind")]
    pub enum ModelSource {
        /// A parameter checkpoint together with the architecture it was trained with.
        Checkpoint {
            arch: ArchConfig,
            file: PathBuf,
            /// Prefixes removed from checkpoint keys, in order.
            #[serde(default = "default_strip_prefixes")]
            strip_prefixes: Vec<String>,
        },
        /// An artifact written by a previous pruning run.
        Pruned { file: PathBuf },
    }

    /// The backbone architecture.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum ArchConfig {
        ResNet18,
        ResNet34,
        ResNet50,
        ResNet101,
        ResNet(ResNetInit),
        /// A json architecture description.
        File { file: PathBuf },
    }

    fn default_strip_prefixes() -> Vec<String> {
        vec!["module.".into(), "resnet.".into()]
    }
}

mod evaluation {
    use super::*;

    /// Evaluation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluationConfig {
        /// The maximum number of detections kept per image.
        #[serde(default = "default_max_per_image")]
        pub max_per_image: usize,
        /// Detections scored below this value are dropped.
        #[serde(default = "default_score_threshold")]
        pub score_threshold: R64,
        /// The directory under `prune_dir` where detection results are written.
        #[serde(default = "default_output_dir")]
        pub output_dir: PathBuf,
        /// The external evaluation program. Evaluation is skipped if not set.
        pub harness: Option<HarnessConfig>,
    }

    impl Default for EvaluationConfig {
        fn default() -> Self {
            Self {
                max_per_image: default_max_per_image(),
                score_threshold: default_score_threshold(),
                output_dir: default_output_dir(),
                harness: None,
            }
        }
    }

    /// An external program that evaluates a saved model.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HarnessConfig {
        pub program: PathBuf,
        /// Arguments placed before the generated ones.
        #[serde(default)]
        pub args: Vec<String>,
    }

    fn default_max_per_image() -> usize {
        300
    }

    fn default_score_threshold() -> R64 {
        r64(0.01)
    }

    fn default_output_dir() -> PathBuf {
        "test".into()
    }
}

fn default_fork_points() -> Vec<usize> {
    vec![10, 19]
}
