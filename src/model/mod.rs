//! Model pair: main classifier and bias predictor

mod bias_predictor;
mod classifier;
mod pair;
mod registry;

pub use bias_predictor::{BiasLoss, BiasPredictor, BiasPredictorArch, BiasVariable, PredictorPass};
pub use classifier::{ForwardPass, TapClassifier};
pub use pair::ModelPair;
pub use registry::{ModelName, LOGITS_TAP};
