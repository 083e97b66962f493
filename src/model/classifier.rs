//! Main classifier with named feature taps
//!
//! The backbone is a stand-in: one dense layer per tap of the architecture's
//! tap table (ReLU after each hidden tap), then the `logits` layer. The tap
//! names and widths are the only architecture-specific facts, so any tap the
//! bias predictor may read exists with its real width.

use super::registry::ModelName;
use crate::nn::{relu, relu_backward, Linear, Module, Param};
use ndarray::Array2;
use rand::Rng;

/// Activations of one forward pass
///
/// Lives for one training step; the trainer rebuilds it for every batch.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    input: Array2<f32>,
    pre: Vec<Array2<f32>>,
    post: Vec<Array2<f32>>,
}

impl ForwardPass {
    pub fn logits(&self) -> &Array2<f32> {
        // the logits layer is always present
        &self.post[self.post.len() - 1]
    }

    /// Output of the tap at `index` (see [`TapClassifier::tap_index`])
    pub fn tap(&self, index: usize) -> Option<&Array2<f32>> {
        self.post.get(index)
    }

    pub fn batch_size(&self) -> usize {
        self.input.nrows()
    }
}

/// Dense tapped classifier
#[derive(Clone, Debug)]
pub struct TapClassifier {
    model: ModelName,
    taps: Vec<String>,
    layers: Vec<Linear>,
}

impl TapClassifier {
    pub fn new<R: Rng>(model: ModelName, in_dims: usize, num_classes: usize, rng: &mut R) -> Self {
        let table = model.tap_table(num_classes);
        let mut layers = Vec::with_capacity(table.len());
        let mut width = in_dims;
        for (tap, out) in &table {
            layers.push(Linear::new(tap, width, *out, rng));
            width = *out;
        }
        Self {
            model,
            taps: table.into_iter().map(|(tap, _)| tap).collect(),
            layers,
        }
    }

    pub fn model(&self) -> ModelName {
        self.model
    }

    pub fn in_dims(&self) -> usize {
        self.layers[0].in_dims()
    }

    pub fn num_classes(&self) -> usize {
        self.layers[self.layers.len() - 1].out_dims()
    }

    /// Position of a tap in forward order
    pub fn tap_index(&self, tap: &str) -> Option<usize> {
        self.taps.iter().position(|t| t == tap)
    }

    pub fn forward(&self, inputs: &Array2<f32>) -> ForwardPass {
        let last = self.layers.len() - 1;
        let mut pre = Vec::with_capacity(self.layers.len());
        let mut post: Vec<Array2<f32>> = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let x = if i == 0 { inputs.view() } else { post[i - 1].view() };
            let z = layer.forward(x);
            let a = if i == last { z.clone() } else { relu(&z) };
            pre.push(z);
            post.push(a);
        }
        ForwardPass {
            input: inputs.clone(),
            pre,
            post,
        }
    }

    /// Backpropagate `grad_logits`, optionally adding an extra gradient at
    /// one tap output (joint training with the bias predictor).
    pub fn backward(
        &mut self,
        pass: &ForwardPass,
        grad_logits: &Array2<f32>,
        tap_grad: Option<(usize, &Array2<f32>)>,
    ) {
        let last = self.layers.len() - 1;
        let mut grad = grad_logits.clone();
        for i in (0..self.layers.len()).rev() {
            if let Some((tap, extra)) = tap_grad {
                if tap == i {
                    grad += extra;
                }
            }
            let grad_pre = if i == last {
                grad
            } else {
                relu_backward(&pass.pre[i], &grad)
            };
            let x = if i == 0 {
                pass.input.view()
            } else {
                pass.post[i - 1].view()
            };
            grad = self.layers[i].backward(x, &grad_pre);
        }
    }
}

impl Module for TapClassifier {
    fn name(&self) -> &str {
        self.model.as_str()
    }

    fn parameters(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }
}
