//! Stochastic Gradient Descent optimizer

use super::adam::ensure_len;
use super::{Optimizer, OptimizerState};
use crate::error::Result;
use crate::nn::Param;
use ndarray::Array2;

/// SGD optimizer with optional momentum and L2 weight decay
#[derive(Debug, Clone)]
pub struct SGD {
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    t: u64,
    velocities: Vec<Option<Array2<f32>>>,
}

impl SGD {
    pub const KIND: &'static str = "SGD";

    /// Create a new SGD optimizer
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            weight_decay: 0.0,
            t: 0,
            velocities: Vec::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for SGD {
    fn step(&mut self, params: &mut [&mut Param]) {
        ensure_len(&mut self.velocities, params.len());
        self.t += 1;

        for (i, param) in params.iter_mut().enumerate() {
            let Some(mut grad) = param.grad().cloned() else {
                continue;
            };
            if self.weight_decay > 0.0 {
                grad = grad + param.data() * self.weight_decay;
            }
            if self.momentum > 0.0 {
                // v = momentum * v - lr * grad
                let velocity = match &self.velocities[i] {
                    Some(v) => v * self.momentum - &grad * self.lr,
                    None => &grad * (-self.lr),
                };
                *param.data_mut() += &velocity;
                self.velocities[i] = Some(velocity);
            } else {
                // Simple SGD: param -= lr * grad
                *param.data_mut() -= &(&grad * self.lr);
            }
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn steps(&self) -> u64 {
        self.t
    }

    fn export_state(&self) -> OptimizerState {
        let mut state = OptimizerState::new(Self::KIND, self.lr, self.t);
        state.export_buffers("velocity", &self.velocities);
        state
    }

    fn import_state(&mut self, state: &OptimizerState) -> Result<()> {
        state.check_kind(Self::KIND)?;
        let velocities = state.import_buffers("velocity")?;
        self.lr = state.lr;
        self.t = state.step;
        self.velocities = velocities;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_plain_sgd_step() {
        let mut p = Param::new("w", array![[1.0, -1.0]]);
        p.accumulate_grad(&array![[0.5, 0.5]]);
        SGD::new(0.1, 0.0).step(&mut [&mut p]);
        assert_relative_eq!(p.data()[[0, 0]], 0.95);
        assert_relative_eq!(p.data()[[0, 1]], -1.05);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut p = Param::new("w", array![[0.0]]);
        let mut sgd = SGD::new(0.1, 0.9);
        for _ in 0..2 {
            p.zero_grad();
            p.accumulate_grad(&array![[1.0]]);
            sgd.step(&mut [&mut p]);
        }
        // -0.1, then -(0.09 + 0.1)
        assert_relative_eq!(p.data()[[0, 0]], -0.29, epsilon = 1e-6);
        assert!(sgd.export_state().slots.contains_key("velocity.0"));
    }
}
