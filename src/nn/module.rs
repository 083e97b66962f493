//! Common capability interface of every trainable model

use super::Param;

/// A model the optimizers and the checkpoint store can see into
pub trait Module {
    /// Architecture name recorded in checkpoints and logs
    fn name(&self) -> &str;

    /// Parameters in a stable order
    fn parameters(&self) -> Vec<&Param>;

    /// Mutable parameters, same order as [`Module::parameters`]
    fn parameters_mut(&mut self) -> Vec<&mut Param>;

    /// Zero out all gradients
    fn zero_grad(&mut self) {
        for param in self.parameters_mut() {
            param.zero_grad();
        }
    }

    /// Total number of scalar parameters
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    /// Name of the first parameter whose value or gradient is not finite
    fn first_non_finite(&self) -> Option<String> {
        self.parameters()
            .into_iter()
            .find(|p| !p.is_finite())
            .map(|p| p.name().to_string())
    }
}
