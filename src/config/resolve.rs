//! Configuration resolver
//!
//! Fills unset hyperparameters with dataset-specific defaults. Explicit
//! values are never overwritten; derived fields are always recomputed from
//! the resolved primary fields.

use super::schema::{BiasVariableType, NanPolicy, RunConfig};
use crate::error::{Error, Result};
use crate::model::ModelName;
use std::path::PathBuf;

/// Default for both `bias_loss_gamma` and `bias_ema_gamma`
pub const DEFAULT_GAMMA: f32 = 0.7;

/// Datasets with a default table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    BiasedMnist,
    CelebA,
    Gqa,
}

impl DatasetKind {
    pub fn from_name(name: &str) -> Result<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "biasedmnist" => Ok(DatasetKind::BiasedMnist),
            "celeba" => Ok(DatasetKind::CelebA),
            "gqa" => Ok(DatasetKind::Gqa),
            _ => Err(Error::config(format!(
                "unknown dataset '{name}'. Supported: biased_mnist, celeba, gqa"
            ))),
        }
    }

    /// Canonical name, also the data subdirectory
    pub fn canonical_name(&self) -> &'static str {
        match self {
            DatasetKind::BiasedMnist => "biased_mnist",
            DatasetKind::CelebA => "celeba",
            DatasetKind::Gqa => "gqa",
        }
    }

    fn defaults(&self) -> DatasetDefaults {
        match self {
            DatasetKind::BiasedMnist => DatasetDefaults {
                optimizer_name: "Adam",
                batch_size: 128,
                lr: 1e-4,
                epochs: 30,
                model_name: ModelName::BiasedMnistCnn,
                num_classes: 10,
                num_bias_classes: Some(10),
                num_envs_per_batch: 16,
                bias_predictor_in_layer: "pooled2",
            },
            DatasetKind::CelebA => DatasetDefaults {
                optimizer_name: "Adam",
                batch_size: 128,
                lr: 1e-4,
                epochs: 20,
                model_name: ModelName::ResNet18,
                num_classes: 2,
                num_bias_classes: Some(2),
                num_envs_per_batch: 4,
                bias_predictor_in_layer: "layer3",
            },
            DatasetKind::Gqa => DatasetDefaults {
                optimizer_name: "Adam",
                batch_size: 128,
                lr: 1e-3,
                epochs: 30,
                model_name: ModelName::UpDn,
                num_classes: 1842,
                num_bias_classes: None,
                num_envs_per_batch: 8,
                bias_predictor_in_layer: "joint",
            },
        }
    }
}

struct DatasetDefaults {
    optimizer_name: &'static str,
    batch_size: usize,
    lr: f32,
    epochs: usize,
    model_name: ModelName,
    num_classes: usize,
    /// `None` when the count comes from the groups found at load time
    num_bias_classes: Option<usize>,
    num_envs_per_batch: usize,
    bias_predictor_in_layer: &'static str,
}

fn set_if_null<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}

/// Resolve a run configuration against its dataset's default table
///
/// Returns a new config; the input is left untouched. Resolving an already
/// resolved config returns an equal config.
pub fn resolve(config: &RunConfig) -> Result<RunConfig> {
    let dataset = DatasetKind::from_name(&config.dataset_name)?;
    let defaults = dataset.defaults();
    let mut out = config.clone();

    out.dataset_name = dataset.canonical_name().to_string();
    set_if_null(&mut out.expt_dir, config.save_dir.join(&config.expt_name));
    set_if_null(&mut out.project_name, out.dataset_name.clone());

    set_if_null(&mut out.optimizer_name, defaults.optimizer_name.to_string());
    set_if_null(&mut out.batch_size, defaults.batch_size);
    set_if_null(&mut out.lr, defaults.lr);
    set_if_null(&mut out.weight_decay, 0.0);
    set_if_null(&mut out.momentum, 0.9);
    set_if_null(&mut out.epochs, defaults.epochs);
    set_if_null(&mut out.model_name, defaults.model_name.as_str().to_string());
    set_if_null(&mut out.bias_predictor_name, "MLP2".to_string());
    set_if_null(&mut out.bias_variable_type, BiasVariableType::Categorical);
    set_if_null(&mut out.num_envs_per_batch, defaults.num_envs_per_batch);
    set_if_null(
        &mut out.bias_predictor_in_layer,
        defaults.bias_predictor_in_layer.to_string(),
    );
    set_if_null(&mut out.bias_loss_gamma, DEFAULT_GAMMA);
    set_if_null(&mut out.bias_ema_gamma, DEFAULT_GAMMA);
    set_if_null(&mut out.bias_predictor_enabled, true);
    set_if_null(&mut out.joint_bias_backprop, false);
    set_if_null(&mut out.nan_policy, NanPolicy::Halt);
    set_if_null(&mut out.save_every, 1);
    set_if_null(&mut out.test_every, 1);
    set_if_null(&mut out.prefetch_batches, 0);

    // Derived fields
    out.data_dir = Some(PathBuf::from(format!(
        "{}/{}",
        config.root_dir.display(),
        out.dataset_name
    )));
    out.num_classes = Some(defaults.num_classes);

    match defaults.num_bias_classes {
        Some(n) => set_if_null(&mut out.num_bias_classes, n),
        None => {
            if let Some(groups) = out.num_groups {
                out.num_bias_classes = Some(groups);
                out.bias_variable_dims = Some(groups);
            }
        }
    }
    if out.bias_variable_type == Some(BiasVariableType::Categorical) {
        if let Some(n) = out.num_bias_classes {
            set_if_null(&mut out.bias_variable_dims, n);
        }
    }

    let model_name = out
        .model_name
        .as_deref()
        .map(ModelName::from_name)
        .transpose()?
        .ok_or_else(|| Error::config("model_name is unset"))?;
    let tap = out
        .bias_predictor_in_layer
        .clone()
        .ok_or_else(|| Error::config("bias_predictor_in_layer is unset"))?;
    let tap_width = model_name
        .tap_width(&tap, defaults.num_classes)
        .ok_or_else(|| {
            let known: Vec<&str> = model_name.hidden_taps().iter().map(|(n, _)| *n).collect();
            Error::config(format!(
                "unknown feature tap '{tap}' for {model_name}. Known taps: {}, logits",
                known.join(", ")
            ))
        })?;
    out.bias_predictor_in_dims = Some(tap_width);
    set_if_null(&mut out.bias_predictor_hid_dims, tap_width);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(dataset: &str) -> RunConfig {
        RunConfig::new(dataset, "/data", "/runs", "expt")
    }

    #[test]
    fn test_biased_mnist_defaults() {
        let resolved = resolve(&base("biased_mnist")).unwrap();
        assert_eq!(resolved.optimizer_name.as_deref(), Some("Adam"));
        assert_eq!(resolved.batch_size, Some(128));
        assert_eq!(resolved.lr, Some(1e-4));
        assert_eq!(resolved.epochs, Some(30));
        assert_eq!(resolved.model_name.as_deref(), Some("BiasedMNISTCNN"));
        assert_eq!(resolved.bias_predictor_name.as_deref(), Some("MLP2"));
        assert_eq!(resolved.num_envs_per_batch, Some(16));
        assert_eq!(resolved.bias_predictor_in_layer.as_deref(), Some("pooled2"));
        assert_eq!(resolved.bias_predictor_in_dims, Some(32));
        assert_eq!(resolved.num_classes, Some(10));
        assert_eq!(resolved.bias_loss_gamma, Some(0.7));
        assert_eq!(resolved.bias_ema_gamma, Some(0.7));
        assert_eq!(
            resolved.data_dir,
            Some(PathBuf::from("/data/biased_mnist"))
        );
        assert_eq!(resolved.expt_dir, Some(PathBuf::from("/runs/expt")));
    }

    #[test]
    fn test_explicit_values_survive() {
        let mut config = base("biased_mnist");
        config.batch_size = Some(32);
        config.lr = Some(0.5);
        config.bias_loss_gamma = Some(0.0);
        config.bias_predictor_in_layer = Some("conv4".to_string());

        let resolved = resolve(&config).unwrap();
        assert_eq!(resolved.batch_size, Some(32));
        assert_eq!(resolved.lr, Some(0.5));
        assert_eq!(resolved.bias_loss_gamma, Some(0.0));
        assert_eq!(resolved.bias_predictor_in_dims, Some(64));
    }

    #[test]
    fn test_stale_derived_fields_are_recomputed() {
        let mut config = base("biased_mnist");
        config.data_dir = Some(PathBuf::from("/stale"));
        config.bias_predictor_in_dims = Some(999);
        config.num_classes = Some(3);

        let resolved = resolve(&config).unwrap();
        assert_eq!(
            resolved.data_dir,
            Some(PathBuf::from("/data/biased_mnist"))
        );
        assert_eq!(resolved.bias_predictor_in_dims, Some(32));
        assert_eq!(resolved.num_classes, Some(10));
    }

    #[test]
    fn test_input_is_not_mutated() {
        let config = base("celeba");
        let before = config.clone();
        let _ = resolve(&config).unwrap();
        assert_eq!(config, before);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        for name in ["biased_mnist", "celeba", "gqa"] {
            let once = resolve(&base(name)).unwrap();
            let twice = resolve(&once).unwrap();
            assert_eq!(once, twice, "{name}");
        }
    }

    #[test]
    fn test_dataset_name_spellings() {
        assert_eq!(
            DatasetKind::from_name("BiasedMNIST").unwrap(),
            DatasetKind::BiasedMnist
        );
        assert_eq!(DatasetKind::from_name("CelebA").unwrap(), DatasetKind::CelebA);
        assert_eq!(DatasetKind::from_name("GQA").unwrap(), DatasetKind::Gqa);
    }

    #[test]
    fn test_unknown_dataset() {
        let err = resolve(&base("imagenet")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unknown_tap() {
        let mut config = base("biased_mnist");
        config.bias_predictor_in_layer = Some("layer3".to_string());
        let err = resolve(&config).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("layer3")));
    }

    #[test]
    fn test_gqa_bias_classes_follow_groups() {
        let resolved = resolve(&base("gqa")).unwrap();
        assert_eq!(resolved.num_bias_classes, None);

        let with_groups = resolve(&resolved.with_num_groups(12)).unwrap();
        assert_eq!(with_groups.num_bias_classes, Some(12));
        assert_eq!(with_groups.bias_variable_dims, Some(12));
        assert_eq!(with_groups.bias_predictor_in_dims, Some(1024));
    }
}
