//! Typed trainer settings
//!
//! `TrainSettings` is the fully populated, read-only view of a resolved
//! [`RunConfig`]. Building it is the single place where a missing or
//! out-of-range hyperparameter turns into a configuration error.

use super::resolve::DatasetKind;
use super::schema::{BiasVariableType, NanPolicy, RunConfig};
use crate::error::{Error, Result};
use crate::model::{BiasPredictorArch, BiasVariable, ModelName};
use crate::optim::OPTIMIZERS;
use std::path::PathBuf;

/// Optimizer selection shared by both models
#[derive(Debug, Clone, PartialEq)]
pub struct OptimSettings {
    pub name: String,
    pub lr: f32,
    pub weight_decay: f32,
    pub momentum: f32,
}

/// Bias predictor architecture and its tap
#[derive(Debug, Clone, PartialEq)]
pub struct BiasPredictorSettings {
    pub arch: BiasPredictorArch,
    pub in_layer: String,
    pub in_dims: usize,
    pub hid_dims: usize,
    pub variable: BiasVariable,
    pub enabled: bool,
    pub joint_backprop: bool,
}

/// Everything the loader and trainer consume
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSettings {
    pub dataset: DatasetKind,
    pub expt_dir: PathBuf,
    pub data_dir: PathBuf,
    pub seed: u64,
    pub optim: OptimSettings,
    pub batch_size: usize,
    pub epochs: usize,
    pub model: ModelName,
    pub num_classes: usize,
    pub bias_predictor: BiasPredictorSettings,
    pub num_envs_per_batch: usize,
    pub bias_loss_gamma: f32,
    pub bias_ema_gamma: f32,
    pub nan_policy: NanPolicy,
    pub save_every: usize,
    pub test_every: usize,
    pub patience: Option<usize>,
    pub prefetch_batches: usize,
    /// `(folds, held-out fold)`
    pub cross_validation: Option<(usize, usize)>,
    pub resume_from: Option<PathBuf>,
}

fn required<T: Clone>(value: &Option<T>, field: &str) -> Result<T> {
    value
        .clone()
        .ok_or_else(|| Error::config(format!("required hyperparameter '{field}' is unset")))
}

fn check_gamma(value: f32, field: &str) -> Result<f32> {
    if !(0.0..=1.0).contains(&value) || !value.is_finite() {
        return Err(Error::config(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(value)
}

fn check_positive(value: usize, field: &str) -> Result<usize> {
    if value == 0 {
        return Err(Error::config(format!("{field} must be > 0")));
    }
    Ok(value)
}

impl TrainSettings {
    /// Check a resolved config before a run touches the filesystem
    ///
    /// The seed and the gqa group count are only known once the run context
    /// exists and the data has been loaded; placeholders stand in for them
    /// here, and everything else goes through [`TrainSettings::from_config`].
    pub fn preflight(config: &RunConfig) -> Result<()> {
        let mut config = config.clone();
        config.random_seed.get_or_insert(0);
        if DatasetKind::from_name(&config.dataset_name)? == DatasetKind::Gqa {
            config.num_bias_classes.get_or_insert(1);
            config.bias_variable_dims.get_or_insert(1);
        }
        Self::from_config(&config).map(|_| ())
    }

    /// Extract settings from a resolved config
    pub fn from_config(config: &RunConfig) -> Result<Self> {
        let dataset = DatasetKind::from_name(&config.dataset_name)?;
        let model = ModelName::from_name(&required(&config.model_name, "model_name")?)?;
        let num_classes = check_positive(required(&config.num_classes, "num_classes")?, "num_classes")?;

        let lr = required(&config.lr, "lr")?;
        if lr <= 0.0 || !lr.is_finite() {
            return Err(Error::config(format!("lr must be > 0, got {lr}")));
        }
        let optimizer_name = required(&config.optimizer_name, "optimizer_name")?;
        if !OPTIMIZERS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(&optimizer_name))
        {
            return Err(Error::config(format!(
                "unknown optimizer '{optimizer_name}'. Supported: {}",
                OPTIMIZERS.join(", ")
            )));
        }
        let optim = OptimSettings {
            name: optimizer_name,
            lr,
            weight_decay: required(&config.weight_decay, "weight_decay")?,
            momentum: required(&config.momentum, "momentum")?,
        };

        let variable = match required(&config.bias_variable_type, "bias_variable_type")? {
            BiasVariableType::Categorical => {
                let classes = config.num_bias_classes.ok_or_else(|| {
                    if dataset == DatasetKind::Gqa {
                        Error::config(
                            "num_bias_classes could not be derived: no groups were discovered while loading gqa",
                        )
                    } else {
                        Error::config("required hyperparameter 'num_bias_classes' is unset")
                    }
                })?;
                BiasVariable::Categorical {
                    num_classes: check_positive(classes, "num_bias_classes")?,
                }
            }
            BiasVariableType::Continuous => BiasVariable::Continuous {
                dims: check_positive(
                    required(&config.bias_variable_dims, "bias_variable_dims")?,
                    "bias_variable_dims",
                )?,
            },
        };

        let in_layer = required(&config.bias_predictor_in_layer, "bias_predictor_in_layer")?;
        let in_dims = model.tap_width(&in_layer, num_classes).ok_or_else(|| {
            Error::config(format!("unknown feature tap '{in_layer}' for {model}"))
        })?;
        if config.bias_predictor_in_dims != Some(in_dims) {
            return Err(Error::config(format!(
                "bias_predictor_in_dims {:?} does not match tap '{in_layer}' width {in_dims}; resolve the config first",
                config.bias_predictor_in_dims
            )));
        }
        let bias_predictor = BiasPredictorSettings {
            arch: BiasPredictorArch::from_name(&required(
                &config.bias_predictor_name,
                "bias_predictor_name",
            )?)?,
            in_layer,
            in_dims,
            hid_dims: check_positive(
                required(&config.bias_predictor_hid_dims, "bias_predictor_hid_dims")?,
                "bias_predictor_hid_dims",
            )?,
            variable,
            enabled: required(&config.bias_predictor_enabled, "bias_predictor_enabled")?,
            joint_backprop: required(&config.joint_bias_backprop, "joint_bias_backprop")?,
        };

        let batch_size = check_positive(required(&config.batch_size, "batch_size")?, "batch_size")?;
        let num_envs_per_batch = check_positive(
            required(&config.num_envs_per_batch, "num_envs_per_batch")?,
            "num_envs_per_batch",
        )?;
        if batch_size < num_envs_per_batch {
            return Err(Error::config(format!(
                "batch_size {batch_size} cannot hold {num_envs_per_batch} non-empty environments"
            )));
        }

        let cross_validation = match (config.cv_folds, config.cv_fold) {
            (None, None) => None,
            (Some(folds), Some(fold)) if folds >= 2 && fold < folds => Some((folds, fold)),
            (folds, fold) => {
                return Err(Error::config(format!(
                    "invalid cross-validation split: cv_folds={folds:?}, cv_fold={fold:?}"
                )))
            }
        };

        Ok(Self {
            dataset,
            expt_dir: required(&config.expt_dir, "expt_dir")?,
            data_dir: required(&config.data_dir, "data_dir")?,
            seed: config.random_seed.ok_or_else(|| {
                Error::config("random_seed is unset; the run context assigns one before training")
            })?,
            optim,
            batch_size,
            epochs: required(&config.epochs, "epochs")?,
            model,
            num_classes,
            bias_predictor,
            num_envs_per_batch,
            bias_loss_gamma: check_gamma(
                required(&config.bias_loss_gamma, "bias_loss_gamma")?,
                "bias_loss_gamma",
            )?,
            bias_ema_gamma: check_gamma(
                required(&config.bias_ema_gamma, "bias_ema_gamma")?,
                "bias_ema_gamma",
            )?,
            nan_policy: required(&config.nan_policy, "nan_policy")?,
            save_every: check_positive(required(&config.save_every, "save_every")?, "save_every")?,
            test_every: check_positive(required(&config.test_every, "test_every")?, "test_every")?,
            patience: config.patience,
            prefetch_batches: required(&config.prefetch_batches, "prefetch_batches")?,
            cross_validation,
            resume_from: config.resume_from.clone(),
        })
    }
}
