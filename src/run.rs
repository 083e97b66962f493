//! End-to-end run pipeline
//!
//! resolve and check -> prepare context -> load data -> re-resolve with the
//! discovered group count -> persist the config -> build loaders -> train.

use crate::config::{resolve, BiasVariableType, RunConfig, TrainSettings};
use crate::context::RunContext;
use crate::data::{DataLoaders, DatasetSplits};
use crate::error::{Error, Result};
use crate::io::{config_dump, save_run_config, CONFIG_FILE};
use crate::train::{BiasAwareTrainer, TrainReport};
use tracing::info;

/// Resolve a config the way a run would, without loading any data.
///
/// Groups are unknown at this point, so dataset defaults that depend on
/// them stay unset.
pub fn resolve_only(config: &RunConfig) -> Result<RunConfig> {
    resolve(config)
}

/// Execute one training run
///
/// The config is resolved and checked before anything is written or read;
/// only the group-dependent settings wait for the data.
pub fn run(config: &RunConfig) -> Result<TrainReport> {
    let first = resolve(config)?;
    TrainSettings::preflight(&first)?;

    let data_dir = first
        .data_dir
        .clone()
        .ok_or_else(|| Error::config("data_dir could not be resolved"))?;
    let num_bias_classes = match first.bias_variable_type {
        Some(BiasVariableType::Categorical) => first.num_bias_classes,
        _ => None,
    };

    let context = RunContext::prepare(config)?;
    let splits = DatasetSplits::load(&data_dir, num_bias_classes)?;

    let resolved = resolve(&context.config.with_num_groups(splits.num_groups()))?;
    let settings = TrainSettings::from_config(&resolved)?;
    save_run_config(&resolved, settings.expt_dir.join(CONFIG_FILE))?;
    info!("resolved configuration:\n{}", config_dump(&resolved)?);

    let input_dims = splits.train.input_dims();
    let loaders = DataLoaders::build(&settings, splits)?;
    BiasAwareTrainer::new(settings, input_dims)?.train(&loaders)
}
