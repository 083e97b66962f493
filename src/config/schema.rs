//! Run configuration schema
//!
//! `RunConfig` is the flat hyperparameter namespace of one run. Only the four
//! fields every run must name are mandatory; everything else is optional and
//! filled in by [`resolve`](super::resolve).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Dataset name (biased_mnist | celeba | gqa)
    pub dataset_name: String,

    /// Root directory that holds one subdirectory per dataset
    pub root_dir: PathBuf,

    /// Directory under which each experiment gets its own run directory
    pub save_dir: PathBuf,

    /// Experiment name; the run directory is `save_dir/expt_name`
    pub expt_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expt_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,

    /// Experiment protocol to run instead of a single training run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expt_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,

    /// Request hardware acceleration
    #[serde(default)]
    pub cuda: bool,

    // Optimization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimizer_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lr: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_decay: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epochs: Option<usize>,

    // Architecture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_classes: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_predictor_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_predictor_in_layer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_predictor_in_dims: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_predictor_hid_dims: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_predictor_enabled: Option<bool>,

    /// Let the bias predictor's gradient flow back into the classifier tap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joint_bias_backprop: Option<bool>,

    // Bias variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_variable_type: Option<BiasVariableType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_bias_classes: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_variable_dims: Option<usize>,

    /// Number of groups discovered while loading the data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_groups: Option<usize>,

    // Environment batching and bias signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_envs_per_batch: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_loss_gamma: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bias_ema_gamma: Option<f32>,

    // Run control
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nan_policy: Option<NanPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_every: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_every: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patience: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefetch_batches: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cv_folds: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cv_fold: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<PathBuf>,
}

impl RunConfig {
    /// Create a config with only the mandatory fields set
    pub fn new(
        dataset_name: impl Into<String>,
        root_dir: impl Into<PathBuf>,
        save_dir: impl Into<PathBuf>,
        expt_name: impl Into<String>,
    ) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            root_dir: root_dir.into(),
            save_dir: save_dir.into(),
            expt_name: expt_name.into(),
            expt_dir: None,
            data_dir: None,
            project_name: None,
            expt_type: None,
            random_seed: None,
            cuda: false,
            optimizer_name: None,
            batch_size: None,
            lr: None,
            weight_decay: None,
            momentum: None,
            epochs: None,
            model_name: None,
            num_classes: None,
            bias_predictor_name: None,
            bias_predictor_in_layer: None,
            bias_predictor_in_dims: None,
            bias_predictor_hid_dims: None,
            bias_predictor_enabled: None,
            joint_bias_backprop: None,
            bias_variable_type: None,
            num_bias_classes: None,
            bias_variable_dims: None,
            num_groups: None,
            num_envs_per_batch: None,
            bias_loss_gamma: None,
            bias_ema_gamma: None,
            nan_policy: None,
            save_every: None,
            test_every: None,
            patience: None,
            prefetch_batches: None,
            cv_folds: None,
            cv_fold: None,
            resume_from: None,
        }
    }

    /// Copy of this config with the group count discovered at load time
    pub fn with_num_groups(&self, num_groups: usize) -> Self {
        let mut config = self.clone();
        config.num_groups = Some(num_groups);
        config
    }

    /// Run directory: explicit `expt_dir` or `save_dir/expt_name`
    pub fn run_dir(&self) -> PathBuf {
        self.expt_dir
            .clone()
            .unwrap_or_else(|| self.save_dir.join(&self.expt_name))
    }
}

/// Kind of bias attribute the predictor is trained on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasVariableType {
    /// Discrete bias classes, cross-entropy
    Categorical,
    /// Real-valued bias vector, squared error
    Continuous,
}

impl FromStr for BiasVariableType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "categorical" => Ok(Self::Categorical),
            "continuous" => Ok(Self::Continuous),
            other => Err(format!(
                "unknown bias variable type '{other}' (expected categorical or continuous)"
            )),
        }
    }
}

impl fmt::Display for BiasVariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Categorical => write!(f, "categorical"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

/// What to do when a loss or gradient turns non-finite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NanPolicy {
    /// Abort the run
    #[default]
    Halt,
    /// Drop the batch and keep training
    Skip,
}

impl FromStr for NanPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown nan policy '{other}' (expected halt or skip)")),
        }
    }
}
