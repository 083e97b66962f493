//! Samples, dataset files and the environment-batched loader

mod dataset;
mod loader;
mod sample;
pub mod synthetic;

pub use dataset::{Dataset, DatasetSplits, TEST_FILE, TRAIN_FILE};
pub use loader::{DataLoaders, EnvironmentEpoch, EnvironmentLoader, EvalLoader};
pub use sample::{Batch, BiasAnnotation, BiasTargets, EnvironmentBatch, Sample};
pub use synthetic::SyntheticConfig;
