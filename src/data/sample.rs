//! Samples and batches

use super::Dataset;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Bias annotation of one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BiasAnnotation {
    /// Categorical bias class (e.g. background color index)
    Class(usize),
    /// Continuous bias vector
    Vector(Vec<f32>),
}

impl BiasAnnotation {
    pub fn class(&self) -> Option<usize> {
        match self {
            Self::Class(c) => Some(*c),
            Self::Vector(_) => None,
        }
    }
}

/// One labelled, bias-annotated example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub input: Vec<f32>,
    pub label: usize,
    pub bias: BiasAnnotation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
}

/// Bias annotations of a batch, in the shape the predictor's loss expects
#[derive(Debug, Clone, PartialEq)]
pub enum BiasTargets {
    Classes(Vec<usize>),
    Values(Array2<f32>),
}

/// Rows of samples stacked into matrices
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
    pub bias: BiasTargets,
    /// Environment id of every row
    pub groups: Vec<usize>,
}

impl Batch {
    /// Stack the samples at `indices`
    ///
    /// The dataset guarantees a uniform input width and bias kind, so
    /// gathering cannot fail.
    pub fn gather(dataset: &Dataset, indices: &[usize]) -> Self {
        let dims = dataset.input_dims();
        let mut inputs = Array2::zeros((indices.len(), dims));
        let mut labels = Vec::with_capacity(indices.len());
        let mut groups = Vec::with_capacity(indices.len());
        for (row, &i) in indices.iter().enumerate() {
            let sample = dataset.sample(i);
            for (j, v) in sample.input.iter().enumerate() {
                inputs[[row, j]] = *v;
            }
            labels.push(sample.label);
            groups.push(dataset.environment(i));
        }

        let bias = match dataset.bias_dims() {
            None => BiasTargets::Classes(
                indices
                    .iter()
                    .map(|&i| dataset.sample(i).bias.class().unwrap_or_default())
                    .collect(),
            ),
            Some(bias_dims) => {
                let mut values = Array2::zeros((indices.len(), bias_dims));
                for (row, &i) in indices.iter().enumerate() {
                    if let BiasAnnotation::Vector(v) = &dataset.sample(i).bias {
                        for (j, x) in v.iter().enumerate() {
                            values[[row, j]] = *x;
                        }
                    }
                }
                BiasTargets::Values(values)
            }
        };

        Self {
            inputs,
            labels,
            bias,
            groups,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// One training batch made of several environments
///
/// Rows are grouped by environment: the first `sizes[0]` rows belong to
/// `environments[0]`, and so on.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentBatch {
    pub batch: Batch,
    pub environments: Vec<usize>,
    pub sizes: Vec<usize>,
}

impl EnvironmentBatch {
    pub fn num_environments(&self) -> usize {
        self.environments.len()
    }

    /// `(environment, row range)` for every environment in the batch
    pub fn spans(&self) -> impl Iterator<Item = (usize, std::ops::Range<usize>)> + '_ {
        let mut start = 0;
        self.environments
            .iter()
            .zip(&self.sizes)
            .map(move |(&env, &size)| {
                let span = start..start + size;
                start += size;
                (env, span)
            })
    }
}
