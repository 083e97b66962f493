//! # Sesgo: bias-aware classifier training
//!
//! Sesgo trains an image classifier together with a bias predictor that
//! reads one of the classifier's feature taps and tries to recover a known
//! spurious attribute. Mini-batches are assembled from bias environments,
//! and an exponential moving average of the predictor's loss per
//! environment reweights the main loss toward examples whose bias is hard
//! to predict.
//!
//! ## Architecture
//!
//! - **config**: run configuration, dataset defaults, CLI
//! - **context**: seed, run directory and device of a run
//! - **data**: samples, dataset files, environment-batched loader
//! - **model**: tapped classifier and bias predictor
//! - **nn**: dense layers, losses, parameters
//! - **optim**: optimizers (SGD, Adam, AdamW)
//! - **train**: bias signal, loss weighting, trainer state machine
//! - **io**: checkpoints (safetensors) and config files
//! - **experiment**: protocols that expand one config into many runs
//! - **run**: the end-to-end pipeline of one run

pub mod config;
pub mod context;
pub mod data;
pub mod experiment;
pub mod io;
pub mod model;
pub mod nn;
pub mod optim;
pub mod run;
pub mod train;

pub mod error;

pub use error::{Error, Result};
