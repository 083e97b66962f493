//! Bias-aware training
//!
//! - [`BiasSignal`]: EMA of bias predictability per (environment, class)
//! - [`weighting`]: how the signal reweights the main loss
//! - [`BiasAwareTrainer`]: the epoch/step state machine
//!
//! # Example
//!
//! ```no_run
//! use sesgo::config::{resolve, RunConfig, TrainSettings};
//! use sesgo::data::{DataLoaders, DatasetSplits};
//! use sesgo::train::BiasAwareTrainer;
//!
//! let mut config = RunConfig::new("biased_mnist", "/data", "/runs", "baseline");
//! config.random_seed = Some(1);
//! let settings = TrainSettings::from_config(&resolve(&config)?)?;
//! let splits = DatasetSplits::load(&settings.data_dir, Some(10))?;
//! let input_dims = splits.train.input_dims();
//! let loaders = DataLoaders::build(&settings, splits)?;
//! let report = BiasAwareTrainer::new(settings, input_dims)?.train(&loaders)?;
//! println!("best test accuracy {:?}", report.best_test_accuracy);
//! # Ok::<(), sesgo::Error>(())
//! ```

mod early_stopping;
mod metrics;
mod signal;
mod trainer;
pub mod weighting;

pub use early_stopping::EarlyStopping;
pub use metrics::{
    EpochRecord, EvalAccumulator, EvalMetrics, MetricsTracker, StepReport, TrainAccumulator,
    TrainMetrics,
};
pub use signal::{observe, BiasSignal, SignalKey, SignalUpdate};
pub use trainer::{BiasAwareTrainer, TrainReport, TrainerState};
