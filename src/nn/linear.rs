//! Dense layer with explicit backward pass

use super::Param;
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;

/// Fully connected layer `y = x W + b`
///
/// `W` is stored `[in, out]`, `b` as `[1, out]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    weight: Param,
    bias: Param,
}

impl Linear {
    /// Uniform init in `[-1/sqrt(in), 1/sqrt(in)]`
    pub fn new<R: Rng>(name: &str, in_dims: usize, out_dims: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_dims.max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((in_dims, out_dims), |_| rng.random_range(-bound..=bound));
        let bias = Array2::from_shape_fn((1, out_dims), |_| rng.random_range(-bound..=bound));
        Self {
            weight: Param::new(format!("{name}.weight"), weight),
            bias: Param::new(format!("{name}.bias"), bias),
        }
    }

    pub fn in_dims(&self) -> usize {
        self.weight.shape().0
    }

    pub fn out_dims(&self) -> usize {
        self.weight.shape().1
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(self.weight.data()) + self.bias.data()
    }

    /// Accumulate parameter gradients and return `dL/dx`
    pub fn backward(&mut self, x: ArrayView2<'_, f32>, grad_out: &Array2<f32>) -> Array2<f32> {
        let grad_w = x.t().dot(grad_out);
        let grad_b = grad_out.sum_axis(Axis(0)).insert_axis(Axis(0));
        self.weight.accumulate_grad(&grad_w);
        self.bias.accumulate_grad(&grad_b);
        grad_out.dot(&self.weight.data().t())
    }

    pub fn params(&self) -> [&Param; 2] {
        [&self.weight, &self.bias]
    }

    pub fn params_mut(&mut self) -> [&mut Param; 2] {
        [&mut self.weight, &mut self.bias]
    }
}

/// ReLU applied element-wise
pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Gate `grad` by the ReLU mask of the pre-activation
pub fn relu_backward(pre: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
    let mut out = grad.clone();
    out.zip_mut_with(pre, |g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    out
}
