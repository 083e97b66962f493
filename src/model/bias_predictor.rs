//! Bias predictor
//!
//! A small model reading the classifier's features at one tap and predicting
//! the bias attribute. Architectures are enum variants selected once from the
//! config; the output head depends on whether the bias variable is
//! categorical (softmax + cross entropy) or continuous (squared error).

use crate::data::BiasTargets;
use crate::error::{Error, Result};
use crate::nn::loss::{argmax_rows, cross_entropy, cross_entropy_grad, mse, mse_grad, softmax_rows};
use crate::nn::{relu, relu_backward, Linear, Module, Param};
use ndarray::{Array1, Array2};
use rand::Rng;
use std::fmt;

/// Known bias predictor architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BiasPredictorArch {
    /// in -> hidden (ReLU) -> out
    Mlp2,
    /// in -> out
    Linear,
}

impl BiasPredictorArch {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "mlp2" => Ok(Self::Mlp2),
            "linear" => Ok(Self::Linear),
            _ => Err(Error::config(format!(
                "unknown bias predictor '{name}'. Supported: MLP2, Linear"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mlp2 => "MLP2",
            Self::Linear => "Linear",
        }
    }
}

impl fmt::Display for BiasPredictorArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the bias predictor predicts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasVariable {
    Categorical { num_classes: usize },
    Continuous { dims: usize },
}

impl BiasVariable {
    pub fn out_dims(&self) -> usize {
        match self {
            Self::Categorical { num_classes } => *num_classes,
            Self::Continuous { dims } => *dims,
        }
    }
}

/// Activations of one predictor forward pass
#[derive(Debug, Clone)]
pub struct PredictorPass {
    input: Array2<f32>,
    pre: Vec<Array2<f32>>,
    post: Vec<Array2<f32>>,
}

impl PredictorPass {
    /// Raw outputs: logits (categorical) or predicted values (continuous)
    pub fn outputs(&self) -> &Array2<f32> {
        &self.post[self.post.len() - 1]
    }
}

/// Per-example bias loss plus what its backward pass needs
#[derive(Debug, Clone)]
pub struct BiasLoss {
    pub per_example: Array1<f32>,
    /// Whether each example's bias class was predicted (categorical only)
    pub correct: Option<Vec<bool>>,
    grad_cache: LossCache,
}

#[derive(Debug, Clone)]
enum LossCache {
    Categorical { probs: Array2<f32>, targets: Vec<usize> },
    Continuous { diff: Array2<f32> },
}

/// Bias predictor model
#[derive(Clone, Debug)]
pub struct BiasPredictor {
    arch: BiasPredictorArch,
    variable: BiasVariable,
    layers: Vec<Linear>,
}

impl BiasPredictor {
    pub fn new<R: Rng>(
        arch: BiasPredictorArch,
        variable: BiasVariable,
        in_dims: usize,
        hid_dims: usize,
        rng: &mut R,
    ) -> Self {
        let out = variable.out_dims();
        let layers = match arch {
            BiasPredictorArch::Mlp2 => vec![
                Linear::new("bias_predictor.fc1", in_dims, hid_dims, rng),
                Linear::new("bias_predictor.fc2", hid_dims, out, rng),
            ],
            BiasPredictorArch::Linear => vec![Linear::new("bias_predictor.fc", in_dims, out, rng)],
        };
        Self {
            arch,
            variable,
            layers,
        }
    }

    pub fn arch(&self) -> BiasPredictorArch {
        self.arch
    }

    pub fn variable(&self) -> BiasVariable {
        self.variable
    }

    pub fn in_dims(&self) -> usize {
        self.layers[0].in_dims()
    }

    pub fn predict(&self, features: &Array2<f32>) -> PredictorPass {
        let last = self.layers.len() - 1;
        let mut pre = Vec::with_capacity(self.layers.len());
        let mut post: Vec<Array2<f32>> = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let x = if i == 0 { features.view() } else { post[i - 1].view() };
            let z = layer.forward(x);
            let a = if i == last { z.clone() } else { relu(&z) };
            pre.push(z);
            post.push(a);
        }
        PredictorPass {
            input: features.clone(),
            pre,
            post,
        }
    }

    /// Probability distribution over bias classes (categorical only)
    pub fn probabilities(&self, pass: &PredictorPass) -> Option<Array2<f32>> {
        match self.variable {
            BiasVariable::Categorical { .. } => Some(softmax_rows(pass.outputs())),
            BiasVariable::Continuous { .. } => None,
        }
    }

    /// Per-example loss against the batch's bias annotations
    pub fn loss(&self, pass: &PredictorPass, targets: &BiasTargets) -> Result<BiasLoss> {
        match (self.variable, targets) {
            (BiasVariable::Categorical { num_classes }, BiasTargets::Classes(classes)) => {
                if let Some(bad) = classes.iter().find(|&&c| c >= num_classes) {
                    return Err(Error::dataset(format!(
                        "bias class {bad} out of range for {num_classes} bias classes"
                    )));
                }
                let (per_example, probs) = cross_entropy(pass.outputs(), classes);
                let predicted = argmax_rows(&probs);
                let correct = predicted.iter().zip(classes).map(|(p, t)| p == t).collect();
                Ok(BiasLoss {
                    per_example,
                    correct: Some(correct),
                    grad_cache: LossCache::Categorical {
                        probs,
                        targets: classes.clone(),
                    },
                })
            }
            (BiasVariable::Continuous { dims }, BiasTargets::Values(values)) => {
                if values.ncols() != dims {
                    return Err(Error::dataset(format!(
                        "bias vectors have {} dims, predictor expects {dims}",
                        values.ncols()
                    )));
                }
                let (per_example, diff) = mse(pass.outputs(), values);
                Ok(BiasLoss {
                    per_example,
                    correct: None,
                    grad_cache: LossCache::Continuous { diff },
                })
            }
            (variable, _) => Err(Error::dataset(format!(
                "bias annotations do not match the {variable:?} bias variable"
            ))),
        }
    }

    /// Backpropagate `sum_i weights[i] * loss_i`; returns the gradient with
    /// respect to the input features.
    pub fn backward(&mut self, pass: &PredictorPass, loss: &BiasLoss, weights: &Array1<f32>) -> Array2<f32> {
        let mut grad = match &loss.grad_cache {
            LossCache::Categorical { probs, targets } => cross_entropy_grad(probs, targets, weights),
            LossCache::Continuous { diff } => mse_grad(diff, weights),
        };
        let last = self.layers.len() - 1;
        for i in (0..self.layers.len()).rev() {
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
        grad
    }
}

impl Module for BiasPredictor {
    fn name(&self) -> &str {
        self.arch.as_str()
    }

    fn parameters(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }
}
