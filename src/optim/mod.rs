//! Optimizers for training the model pair

mod adam;
mod adamw;
mod optimizer;
mod sgd;

pub use adam::Adam;
pub use adamw::AdamW;
pub use optimizer::{Optimizer, OptimizerState};
pub use sgd::SGD;

use crate::config::OptimSettings;
use crate::error::{Error, Result};

/// Optimizer names accepted by [`build_optimizer`]
pub const OPTIMIZERS: [&str; 3] = ["Adam", "AdamW", "SGD"];

/// Build the optimizer named in the settings
pub fn build_optimizer(settings: &OptimSettings) -> Result<Box<dyn Optimizer>> {
    match settings.name.to_lowercase().as_str() {
        "adam" => Ok(Box::new(Adam::default_params(settings.lr))),
        "adamw" => Ok(Box::new(AdamW::new(
            settings.lr,
            0.9,
            0.999,
            1e-8,
            settings.weight_decay,
        ))),
        "sgd" => Ok(Box::new(
            SGD::new(settings.lr, settings.momentum).with_weight_decay(settings.weight_decay),
        )),
        other => Err(Error::config(format!(
            "unknown optimizer '{other}'. Supported: {}",
            OPTIMIZERS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(name: &str) -> OptimSettings {
        OptimSettings {
            name: name.to_string(),
            lr: 0.01,
            weight_decay: 0.0,
            momentum: 0.9,
        }
    }

    #[test]
    fn test_build_known_optimizers() {
        for (name, kind) in [("Adam", "Adam"), ("adamw", "AdamW"), ("SGD", "SGD")] {
            let opt = build_optimizer(&settings(name)).unwrap();
            assert_eq!(opt.export_state().kind, kind);
            assert_eq!(opt.lr(), 0.01);
        }
    }

    #[test]
    fn test_unknown_optimizer() {
        assert!(matches!(
            build_optimizer(&settings("lbfgs")),
            Err(Error::Configuration(_))
        ));
    }
}
