//! Neural network building blocks
//!
//! Dense layers with explicit backward passes over `ndarray` matrices,
//! per-example losses, and the [`Module`] trait shared by the classifier and
//! the bias predictor.

mod linear;
pub mod loss;
mod module;
mod param;

pub use linear::{relu, relu_backward, Linear};
pub use module::Module;
pub use param::Param;
