//! Experiment protocols
//!
//! A protocol turns one base config into a list of variants; the driver
//! validates the protocol and builds every variant before the first run
//! starts, then calls the run function once per variant with its own copy.

use crate::config::{resolve, RunConfig};
use crate::error::{Error, Result};
use crate::model::ModelName;
use tracing::{error, info};

/// One run of a protocol
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// Suffix appended to `expt_name`
    pub label: String,
    pub config: RunConfig,
}

/// A named experiment protocol
#[derive(Debug, Clone, Copy)]
pub struct Protocol {
    pub name: &'static str,
    pub description: &'static str,
    build: fn(&RunConfig) -> Result<Vec<(String, RunConfig)>>,
}

impl Protocol {
    /// Build every variant of this protocol from `base`
    pub fn variants(&self, base: &RunConfig) -> Result<Vec<Variant>> {
        Ok((self.build)(base)?
            .into_iter()
            .map(|(label, mut config)| {
                config.expt_name = format!("{}_{label}", base.expt_name);
                config.expt_dir = base.expt_dir.as_ref().map(|dir| dir.join(&label));
                Variant { label, config }
            })
            .collect())
    }
}

const BIAS_LOSS_GAMMAS: [f32; 5] = [0.0, 0.3, 0.5, 0.7, 0.9];
const BIAS_EMA_GAMMAS: [f32; 4] = [0.5, 0.7, 0.9, 0.99];
const REPEAT_SEEDS: [u64; 3] = [1, 2, 3];
const CV_FOLDS: usize = 5;

fn bias_loss_gamma_sweep(base: &RunConfig) -> Result<Vec<(String, RunConfig)>> {
    Ok(BIAS_LOSS_GAMMAS
        .iter()
        .map(|&gamma| {
            let mut config = base.clone();
            config.bias_loss_gamma = Some(gamma);
            (format!("bias_loss_gamma_{gamma}"), config)
        })
        .collect())
}

fn bias_ema_gamma_sweep(base: &RunConfig) -> Result<Vec<(String, RunConfig)>> {
    Ok(BIAS_EMA_GAMMAS
        .iter()
        .map(|&gamma| {
            let mut config = base.clone();
            config.bias_ema_gamma = Some(gamma);
            (format!("bias_ema_gamma_{gamma}"), config)
        })
        .collect())
}

fn seed_repeat(base: &RunConfig) -> Result<Vec<(String, RunConfig)>> {
    Ok(REPEAT_SEEDS
        .iter()
        .map(|&seed| {
            let mut config = base.clone();
            config.random_seed = Some(seed);
            (format!("seed_{seed}"), config)
        })
        .collect())
}

fn predictor_ablation(base: &RunConfig) -> Result<Vec<(String, RunConfig)>> {
    let mut full = base.clone();
    full.bias_predictor_enabled = Some(true);
    let mut ablated = base.clone();
    ablated.bias_predictor_enabled = Some(false);
    Ok(vec![
        ("full".to_string(), full),
        ("no_bias_predictor".to_string(), ablated),
    ])
}

fn tap_sweep(base: &RunConfig) -> Result<Vec<(String, RunConfig)>> {
    let resolved = resolve(base)?;
    let model = ModelName::from_name(resolved.model_name.as_deref().unwrap_or_default())?;
    Ok(model
        .hidden_taps()
        .iter()
        .map(|(tap, _)| {
            let mut config = base.clone();
            config.bias_predictor_in_layer = Some(tap.to_string());
            // widths follow the tap
            config.bias_predictor_in_dims = None;
            config.bias_predictor_hid_dims = None;
            (format!("tap_{tap}"), config)
        })
        .collect())
}

fn cross_validation(base: &RunConfig) -> Result<Vec<(String, RunConfig)>> {
    Ok((0..CV_FOLDS)
        .map(|fold| {
            let mut config = base.clone();
            config.cv_folds = Some(CV_FOLDS);
            config.cv_fold = Some(fold);
            (format!("fold_{fold}"), config)
        })
        .collect())
}

/// Registered protocols
pub const PROTOCOLS: &[Protocol] = &[
    Protocol {
        name: "bias_loss_gamma_sweep",
        description: "sweep bias_loss_gamma over 0.0, 0.3, 0.5, 0.7, 0.9",
        build: bias_loss_gamma_sweep,
    },
    Protocol {
        name: "bias_ema_gamma_sweep",
        description: "sweep bias_ema_gamma over 0.5, 0.7, 0.9, 0.99",
        build: bias_ema_gamma_sweep,
    },
    Protocol {
        name: "seed_repeat",
        description: "repeat the run with seeds 1, 2 and 3",
        build: seed_repeat,
    },
    Protocol {
        name: "predictor_ablation",
        description: "full model vs. bias predictor disabled",
        build: predictor_ablation,
    },
    Protocol {
        name: "tap_sweep",
        description: "attach the bias predictor to every hidden tap of the model",
        build: tap_sweep,
    },
    Protocol {
        name: "cross_validation",
        description: "5-fold cross-validation over the training split",
        build: cross_validation,
    },
];

/// Look up a protocol by name
pub fn protocol(name: &str) -> Result<&'static Protocol> {
    PROTOCOLS.iter().find(|p| p.name == name).ok_or_else(|| {
        let known: Vec<&str> = PROTOCOLS.iter().map(|p| p.name).collect();
        Error::config(format!(
            "unknown experiment protocol '{name}'. Known: {}",
            known.join(", ")
        ))
    })
}

/// Run the protocol named by `config.expt_type` (a single plain run when
/// unset), returning each variant's label with its result.
pub fn run_experiment<T, F>(config: &RunConfig, mut run_fn: F) -> Result<Vec<(String, T)>>
where
    F: FnMut(RunConfig) -> Result<T>,
{
    let variants = match config.expt_type.as_deref() {
        None => vec![Variant {
            label: config.expt_name.clone(),
            config: config.clone(),
        }],
        Some(name) => {
            let variants = protocol(name)?.variants(config)?;
            info!(protocol = name, variants = variants.len(), "experiment planned");
            variants
        }
    };

    let mut results = Vec::with_capacity(variants.len());
    for Variant { label, config } in variants {
        info!(variant = %label, expt_name = %config.expt_name, "starting run");
        let result = run_fn(config).inspect_err(|e| {
            error!(variant = %label, error = %e, "run failed");
        })?;
        results.push((label, result));
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base() -> RunConfig {
        RunConfig::new("biased_mnist", "/data", "/runs", "exp")
    }

    #[test]
    fn test_unknown_protocol_fails_before_any_run() {
        let mut config = base();
        config.expt_type = Some("grid_of_everything".to_string());
        let mut calls = 0;
        let err = run_experiment(&config, |_| {
            calls += 1;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_no_protocol_runs_once_with_copy() {
        let config = base();
        let results = run_experiment(&config, |c| Ok(c)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, config);
    }

    #[test]
    fn test_gamma_sweep_variants_are_independent() {
        let mut config = base();
        config.expt_type = Some("bias_loss_gamma_sweep".to_string());
        let seen = run_experiment(&config, |mut c| {
            let gamma = c.bias_loss_gamma;
            // mutating one copy must not leak into the next
            c.bias_ema_gamma = Some(0.123);
            Ok((gamma, c.expt_name))
        })
        .unwrap();
        let gammas: Vec<_> = seen.iter().map(|(_, (g, _))| g.unwrap()).collect();
        assert_eq!(gammas, BIAS_LOSS_GAMMAS.to_vec());
        let names: std::collections::BTreeSet<_> = seen.iter().map(|(_, (_, n))| n.clone()).collect();
        assert_eq!(names.len(), 5);
        assert_eq!(config.bias_loss_gamma, None);
    }

    #[test]
    fn test_variant_dirs_are_separate() {
        let mut config = base();
        config.expt_dir = Some(PathBuf::from("/runs/exp"));
        let variants = protocol("seed_repeat").unwrap().variants(&config).unwrap();
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[1].config.random_seed, Some(2));
        assert_eq!(variants[1].config.expt_dir, Some(PathBuf::from("/runs/exp/seed_2")));
        assert_eq!(variants[1].config.expt_name, "exp_seed_2");
    }

    #[test]
    fn test_tap_sweep_covers_hidden_taps() {
        let variants = protocol("tap_sweep").unwrap().variants(&base()).unwrap();
        let taps: Vec<_> = variants
            .iter()
            .map(|v| v.config.bias_predictor_in_layer.clone().unwrap())
            .collect();
        assert_eq!(taps, ["conv1", "conv2", "pooled2", "conv3", "conv4", "conv5", "pooled5"]);
        for v in &variants {
            assert!(resolve(&v.config).is_ok());
        }
    }

    #[test]
    fn test_ablation_and_cv() {
        let ablation = protocol("predictor_ablation").unwrap().variants(&base()).unwrap();
        assert_eq!(ablation[1].config.bias_predictor_enabled, Some(false));
        let cv = protocol("cross_validation").unwrap().variants(&base()).unwrap();
        assert_eq!(cv.len(), 5);
        assert_eq!(cv[4].config.cv_fold, Some(4));
        assert_eq!(protocol("bias_ema_gamma_sweep").unwrap().variants(&base()).unwrap().len(), 4);
    }
}
