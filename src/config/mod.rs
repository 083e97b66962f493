//! Run configuration
//!
//! A run starts from a [`RunConfig`] (CLI flags and/or a YAML/JSON file),
//! goes through [`resolve`] once to pick up the dataset's defaults, and is
//! then read through [`TrainSettings`].
//!
//! # Example
//!
//! ```yaml
//! dataset_name: biased_mnist
//! root_dir: ./data
//! save_dir: ./runs
//! expt_name: baseline
//! bias_loss_gamma: 0.5
//! bias_predictor_in_layer: conv3
//! ```

mod cli;
mod resolve;
mod schema;
mod validate;


pub use cli::{apply_overrides, parse_args, Cli, Command, RunArgs};
pub use resolve::{resolve, DatasetKind, DEFAULT_GAMMA};
pub use schema::{BiasVariableType, NanPolicy, RunConfig};
pub use validate::{BiasPredictorSettings, OptimSettings, TrainSettings};
