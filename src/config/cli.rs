//! CLI argument parsing
//!
//! # Usage
//!
//! ```bash
//! sesgo train --dataset-name biased_mnist --root-dir ./data --save-dir ./runs --expt-name baseline
//! sesgo train --config run.yaml --bias-loss-gamma 0.3
//! sesgo train --config run.yaml --expt-type bias_loss_gamma_sweep
//! sesgo resolve --config run.yaml
//! sesgo protocols
//! ```

use super::schema::{BiasVariableType, NanPolicy, RunConfig};
use crate::error::{Error, Result};
use crate::io::load_run_config;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// sesgo: bias-aware classifier training
#[derive(Parser, Debug, Clone, PartialEq)]
#[command(name = "sesgo")]
#[command(version)]
#[command(about = "Train classifiers that resist a spurious bias attribute")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Train one run, or every run of an experiment protocol
    Train(RunArgs),

    /// Print the resolved configuration without training
    Resolve(RunArgs),

    /// List the registered experiment protocols
    Protocols,
}

/// Run configuration flags; each one overrides the `--config` file
#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct RunArgs {
    /// Base configuration file (YAML or JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub dataset_name: Option<String>,

    #[arg(long)]
    pub root_dir: Option<PathBuf>,

    #[arg(long)]
    pub save_dir: Option<PathBuf>,

    #[arg(long)]
    pub expt_name: Option<String>,

    /// Experiment protocol (see `sesgo protocols`)
    #[arg(long)]
    pub expt_type: Option<String>,

    #[arg(long)]
    pub random_seed: Option<u64>,

    /// Request hardware acceleration
    #[arg(long)]
    pub cuda: bool,

    #[arg(long)]
    pub optimizer_name: Option<String>,

    #[arg(short, long)]
    pub batch_size: Option<usize>,

    #[arg(short, long)]
    pub lr: Option<f32>,

    #[arg(short, long)]
    pub epochs: Option<usize>,

    #[arg(long)]
    pub model_name: Option<String>,

    #[arg(long)]
    pub bias_predictor_name: Option<String>,

    #[arg(long)]
    pub bias_predictor_in_layer: Option<String>,

    #[arg(long)]
    pub bias_predictor_hid_dims: Option<usize>,

    #[arg(long)]
    pub bias_variable_type: Option<BiasVariableType>,

    #[arg(long)]
    pub num_envs_per_batch: Option<usize>,

    #[arg(long)]
    pub bias_loss_gamma: Option<f32>,

    #[arg(long)]
    pub bias_ema_gamma: Option<f32>,

    /// Backpropagate the bias predictor loss into the classifier tap
    #[arg(long)]
    pub joint_bias_backprop: bool,

    /// Train without the bias predictor
    #[arg(long)]
    pub no_bias_predictor: bool,

    #[arg(long)]
    pub nan_policy: Option<NanPolicy>,

    /// Save a checkpoint every N epochs
    #[arg(long)]
    pub save_every: Option<usize>,

    /// Evaluate on the test split every N epochs
    #[arg(long)]
    pub test_every: Option<usize>,

    /// Stop after N epochs without test accuracy improvement
    #[arg(long)]
    pub patience: Option<usize>,

    /// Batches produced ahead of the trainer (0 = off)
    #[arg(long)]
    pub prefetch_batches: Option<usize>,

    /// Resume from a checkpoint file
    #[arg(long)]
    pub resume_from: Option<PathBuf>,
}

fn missing(flag: &str) -> Error {
    Error::config(format!("--{flag} is required when no --config file is given"))
}

impl RunArgs {
    /// Build the initial run configuration: config file first, flags on top
    pub fn to_run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => load_run_config(path)?,
            None => RunConfig::new(
                self.dataset_name.clone().ok_or_else(|| missing("dataset-name"))?,
                self.root_dir.clone().ok_or_else(|| missing("root-dir"))?,
                self.save_dir.clone().ok_or_else(|| missing("save-dir"))?,
                self.expt_name.clone().ok_or_else(|| missing("expt-name"))?,
            ),
        };
        apply_overrides(&mut config, self);
        Ok(config)
    }
}

pub fn parse_args<I, T>(args: I) -> std::result::Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args)
}

fn override_with<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if value.is_some() {
        *slot = value.clone();
    }
}

/// Apply command-line overrides to a RunConfig
pub fn apply_overrides(config: &mut RunConfig, args: &RunArgs) {
    if let Some(name) = &args.dataset_name {
        config.dataset_name = name.clone();
    }
    if let Some(dir) = &args.root_dir {
        config.root_dir = dir.clone();
    }
    if let Some(dir) = &args.save_dir {
        config.save_dir = dir.clone();
    }
    if let Some(name) = &args.expt_name {
        config.expt_name = name.clone();
    }
    if args.cuda {
        config.cuda = true;
    }
    if args.joint_bias_backprop {
        config.joint_bias_backprop = Some(true);
    }
    if args.no_bias_predictor {
        config.bias_predictor_enabled = Some(false);
    }
    override_with(&mut config.expt_type, &args.expt_type);
    override_with(&mut config.random_seed, &args.random_seed);
    override_with(&mut config.optimizer_name, &args.optimizer_name);
    override_with(&mut config.batch_size, &args.batch_size);
    override_with(&mut config.lr, &args.lr);
    override_with(&mut config.epochs, &args.epochs);
    override_with(&mut config.model_name, &args.model_name);
    override_with(&mut config.bias_predictor_name, &args.bias_predictor_name);
    override_with(&mut config.bias_predictor_in_layer, &args.bias_predictor_in_layer);
    override_with(&mut config.bias_predictor_hid_dims, &args.bias_predictor_hid_dims);
    override_with(&mut config.bias_variable_type, &args.bias_variable_type);
    override_with(&mut config.num_envs_per_batch, &args.num_envs_per_batch);
    override_with(&mut config.bias_loss_gamma, &args.bias_loss_gamma);
    override_with(&mut config.bias_ema_gamma, &args.bias_ema_gamma);
    override_with(&mut config.nan_policy, &args.nan_policy);
    override_with(&mut config.save_every, &args.save_every);
    override_with(&mut config.test_every, &args.test_every);
    override_with(&mut config.patience, &args.patience);
    override_with(&mut config.prefetch_batches, &args.prefetch_batches);
    override_with(&mut config.resume_from, &args.resume_from);
}
