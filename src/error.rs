//! Error types for sesgo

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad, missing or conflicting hyperparameters; unknown dataset or protocol.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Missing annotations, empty environments, loader exhausted mid-epoch.
    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Numerical instability at epoch {epoch}, step {step}: {metric} is not finite")]
    NumericalInstability {
        epoch: usize,
        step: usize,
        metric: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn dataset(msg: impl Into<String>) -> Self {
        Error::Dataset(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
