//! Adam optimizer

use super::{Optimizer, OptimizerState};
use crate::error::Result;
use crate::nn::Param;
use ndarray::Array2;

/// Adam optimizer (Adaptive Moment Estimation)
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: u64,
    m: Vec<Option<Array2<f32>>>, // First moment
    v: Vec<Option<Array2<f32>>>, // Second moment
}

impl Adam {
    pub const KIND: &'static str = "Adam";

    /// Create a new Adam optimizer
    pub fn new(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    /// Create Adam with default parameters
    pub fn default_params(lr: f32) -> Self {
        Self::new(lr, 0.9, 0.999, 1e-8)
    }
}

/// Grow the moment buffers to cover `n` parameters
pub(super) fn ensure_len(buffers: &mut Vec<Option<Array2<f32>>>, n: usize) {
    if buffers.len() < n {
        buffers.resize(n, None);
    }
}

/// One Adam moment update; returns the adaptive step `lr_t * m / (sqrt(v) + eps)`
#[allow(clippy::too_many_arguments)]
pub(super) fn adam_update(
    grad: &Array2<f32>,
    m: &mut Option<Array2<f32>>,
    v: &mut Option<Array2<f32>>,
    beta1: f32,
    beta2: f32,
    lr_t: f32,
    epsilon: f32,
) -> Array2<f32> {
    // m_t = β1 * m_{t-1} + (1 - β1) * g
    let m_t = match m.as_ref() {
        Some(m) => m * beta1 + grad * (1.0 - beta1),
        None => grad * (1.0 - beta1),
    };

    // v_t = β2 * v_{t-1} + (1 - β2) * g²
    let grad_sq = grad * grad;
    let v_t = match v.as_ref() {
        Some(v) => v * beta2 + &grad_sq * (1.0 - beta2),
        None => &grad_sq * (1.0 - beta2),
    };

    let update = &m_t / &(v_t.mapv(f32::sqrt) + epsilon) * lr_t;
    *m = Some(m_t);
    *v = Some(v_t);
    update
}

/// Bias-corrected step size for step `t`
pub(super) fn corrected_lr(lr: f32, beta1: f32, beta2: f32, t: u64) -> f32 {
    let t = t.min(i32::MAX as u64) as i32;
    lr * ((1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t)))
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Param]) {
        ensure_len(&mut self.m, params.len());
        ensure_len(&mut self.v, params.len());
        self.t += 1;
        let lr_t = corrected_lr(self.lr, self.beta1, self.beta2, self.t);

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
            // θ_t = θ_{t-1} - lr_t * m_t / (√v_t + ε)
            *param.data_mut() -= &update;
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
