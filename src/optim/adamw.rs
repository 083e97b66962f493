//! AdamW optimizer (Adam with decoupled Weight decay)

use super::adam::{adam_update, corrected_lr, ensure_len};
use super::{Optimizer, OptimizerState};
use crate::error::Result;
use crate::nn::Param;
use ndarray::Array2;

/// AdamW optimizer
///
/// Weight decay is applied directly to the parameters instead of being
/// added to the gradient:
///
/// AdamW: θ_t = (1 - lr * λ) * θ_{t-1} - lr_t * m_t / (√v_t + ε)
#[derive(Debug, Clone)]
pub struct AdamW {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    t: u64,
    m: Vec<Option<Array2<f32>>>, // First moment
    v: Vec<Option<Array2<f32>>>, // Second moment
}

impl AdamW {
    pub const KIND: &'static str = "AdamW";

    /// Create a new AdamW optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Create AdamW with default parameters (weight_decay = 0.01)
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8, 0.01)
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [&mut Param]) {
        ensure_len(&mut self.m, params.len());
        ensure_len(&mut self.v, params.len());
        self.t += 1;
        let lr_t = corrected_lr(self.lr, self.beta1, self.beta2, self.t);
        let decay = 1.0 - self.lr * self.weight_decay;

        for (i, param) in params.iter_mut().enumerate() {
            let Some(grad) = param.grad().cloned() else {
                continue;
            };
            let update = adam_update(
                &grad,
                &mut self.m[i],
                &mut self.v[i],
                self.beta1,
                self.beta2,
                lr_t,
                self.epsilon,
            );
            let data = param.data_mut();
            data.mapv_inplace(|x| x * decay);
            *data -= &update;
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
        state.export_buffers("m", &self.m);
        state.export_buffers("v", &self.v);
        state
    }

    fn import_state(&mut self, state: &OptimizerState) -> Result<()> {
        state.check_kind(Self::KIND)?;
        let m = state.import_buffers("m")?;
        let v = state.import_buffers("v")?;
        self.lr = state.lr;
        self.t = state.step;
        self.m = m;
        self.v = v;
        Ok(())
    }
}
