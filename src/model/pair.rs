//! The classifier and bias predictor trained together

use super::{BiasPredictor, TapClassifier};
use crate::config::TrainSettings;
use crate::error::{Error, Result};
use rand::Rng;

/// Main classifier plus bias predictor
#[derive(Clone, Debug)]
pub struct ModelPair {
    pub classifier: TapClassifier,
    pub bias_predictor: BiasPredictor,
    /// Forward-order index of the tap the predictor reads
    tap: usize,
}

impl ModelPair {
    /// Freshly initialized pair for inputs of width `input_dims`
    pub fn new<R: Rng>(settings: &TrainSettings, input_dims: usize, rng: &mut R) -> Result<Self> {
        let classifier = TapClassifier::new(settings.model, input_dims, settings.num_classes, rng);
        let bp = &settings.bias_predictor;
        let tap = classifier.tap_index(&bp.in_layer).ok_or_else(|| {
            Error::config(format!("unknown feature tap '{}' for {}", bp.in_layer, settings.model))
        })?;
        let bias_predictor = BiasPredictor::new(bp.arch, bp.variable, bp.in_dims, bp.hid_dims, rng);
        Ok(Self {
            classifier,
            bias_predictor,
            tap,
        })
    }

    pub fn tap(&self) -> usize {
        self.tap
    }
}
