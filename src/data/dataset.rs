//! In-memory datasets and the JSON-lines file format

use super::sample::{BiasAnnotation, Sample};
use crate::error::{Error, Result};
use crate::model::BiasVariable;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Training split file name under the data directory
pub const TRAIN_FILE: &str = "train.jsonl";
/// Evaluation split file name under the data directory
pub const TEST_FILE: &str = "test.jsonl";

#[derive(Deserialize)]
struct Record {
    input: Vec<f32>,
    label: usize,
    #[serde(default)]
    bias: Option<BiasAnnotation>,
    #[serde(default)]
    group: Option<usize>,
}

/// Samples with their environment assignment
///
/// Every sample has the same input width and the same bias kind (class or
/// vector of a fixed width).
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    samples: Vec<Sample>,
    environments: Vec<usize>,
    input_dims: usize,
    bias_dims: Option<usize>,
}

fn environment_of(sample: &Sample, num_bias_classes: Option<usize>) -> Result<usize> {
    if let Some(group) = sample.group {
        return Ok(group);
    }
    match (&sample.bias, num_bias_classes) {
        (BiasAnnotation::Class(class), Some(n)) => {
            if *class >= n {
                return Err(Error::dataset(format!(
                    "bias class {class} out of range for {n} bias classes"
                )));
            }
            sample
                .label
                .checked_mul(n)
                .and_then(|v| v.checked_add(*class))
                .ok_or_else(|| {
                    Error::dataset(format!(
                        "label {} is too large to form an environment id",
                        sample.label
                    ))
                })
        }
        (BiasAnnotation::Class(_), None) => Err(Error::dataset(
            "sample has no group and the number of bias classes is unknown",
        )),
        (BiasAnnotation::Vector(_), _) => Err(Error::dataset(
            "samples with a continuous bias need an explicit group",
        )),
    }
}

impl Dataset {
    /// Build a dataset, assigning every sample its environment
    ///
    /// The environment is the sample's `group` when present, otherwise the
    /// (label, bias class) pair.
    pub fn from_samples(samples: Vec<Sample>, num_bias_classes: Option<usize>) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| Error::dataset("dataset is empty"))?;
        let input_dims = first.input.len();
        let bias_dims = match &first.bias {
            BiasAnnotation::Class(_) => None,
            BiasAnnotation::Vector(v) => Some(v.len()),
        };

        let mut environments = Vec::with_capacity(samples.len());
        for (i, sample) in samples.iter().enumerate() {
            if sample.input.len() != input_dims {
                return Err(Error::dataset(format!(
                    "sample {i} has {} input features, expected {input_dims}",
                    sample.input.len()
                )));
            }
            let kind = match &sample.bias {
                BiasAnnotation::Class(_) => None,
                BiasAnnotation::Vector(v) => Some(v.len()),
            };
            if kind != bias_dims {
                return Err(Error::dataset(format!(
                    "sample {i} has a different bias annotation kind than sample 0"
                )));
            }
            environments.push(
                environment_of(sample, num_bias_classes)
                    .map_err(|e| Error::dataset(format!("sample {i}: {e}")))?,
            );
        }

        Ok(Self {
            samples,
            environments,
            input_dims,
            bias_dims,
        })
    }

    /// Read a JSON-lines file (one sample per line, blank lines ignored)
    pub fn load_jsonl(path: impl AsRef<Path>, num_bias_classes: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::dataset(format!("cannot read {}: {e}", path.display())))?;

        let mut samples = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(line).map_err(|e| {
                Error::dataset(format!("{}:{}: {e}", path.display(), n + 1))
            })?;
            let bias = record.bias.ok_or_else(|| {
                Error::dataset(format!(
                    "{}:{}: missing bias annotation",
                    path.display(),
                    n + 1
                ))
            })?;
            samples.push(Sample {
                input: record.input,
                label: record.label,
                bias,
                group: record.group,
            });
        }

        let dataset = Self::from_samples(samples, num_bias_classes)
            .map_err(|e| Error::dataset(format!("{}: {e}", path.display())))?;
        debug!(
            path = %path.display(),
            samples = dataset.len(),
            groups = dataset.num_groups(),
            "loaded dataset file"
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn input_dims(&self) -> usize {
        self.input_dims
    }

    /// Width of the bias vectors, `None` for categorical bias
    pub fn bias_dims(&self) -> Option<usize> {
        self.bias_dims
    }

    pub fn sample(&self, index: usize) -> &Sample {
        &self.samples[index]
    }

    pub fn environment(&self, index: usize) -> usize {
        self.environments[index]
    }

    pub fn environments(&self) -> &[usize] {
        &self.environments
    }

    /// Number of groups, taking group ids as dense indices
    pub fn num_groups(&self) -> usize {
        self.environments.iter().max().map_or(0, |max| max + 1)
    }

    /// Distinct environment ids present
    pub fn distinct_environments(&self) -> BTreeSet<usize> {
        self.environments.iter().copied().collect()
    }

    /// Check labels and bias annotations against the model configuration
    pub fn check_annotations(&self, num_classes: usize, variable: BiasVariable) -> Result<()> {
        if let Some((i, s)) = self
            .samples
            .iter()
            .enumerate()
            .find(|(_, s)| s.label >= num_classes)
        {
            return Err(Error::dataset(format!(
                "sample {i} has label {} but the model has {num_classes} classes",
                s.label
            )));
        }
        match (variable, self.bias_dims) {
            (BiasVariable::Categorical { num_classes: n }, None) => {
                if let Some((i, class)) = self
                    .samples
                    .iter()
                    .filter_map(|s| s.bias.class())
                    .enumerate()
                    .find(|(_, c)| *c >= n)
                {
                    return Err(Error::dataset(format!(
                        "sample {i} has bias class {class} but there are {n} bias classes"
                    )));
                }
                Ok(())
            }
            (BiasVariable::Continuous { dims }, Some(found)) if dims == found => Ok(()),
            (variable, found) => Err(Error::dataset(format!(
                "bias annotations ({}) do not match the {variable:?} bias variable",
                match found {
                    Some(d) => format!("{d}-dim vectors"),
                    None => "classes".to_string(),
                }
            ))),
        }
    }

    /// Dataset of the samples at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            samples: indices.iter().map(|&i| self.samples[i].clone()).collect(),
            environments: indices.iter().map(|&i| self.environments[i]).collect(),
            input_dims: self.input_dims,
            bias_dims: self.bias_dims,
        }
    }

    /// Deterministic k-fold split; returns `(training pool, held-out fold)`
    pub fn split_fold(&self, folds: usize, fold: usize, seed: u64) -> Result<(Self, Self)> {
        if folds < 2 || fold >= folds {
            return Err(Error::config(format!(
                "invalid cross-validation split: fold {fold} of {folds}"
            )));
        }
        if self.len() < folds {
            return Err(Error::dataset(format!(
                "{} samples cannot be split into {folds} folds",
                self.len()
            )));
        }
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let (held_out, pool): (Vec<(usize, usize)>, Vec<(usize, usize)>) = order
            .into_iter()
            .enumerate()
            .partition(|(pos, _)| pos % folds == fold);
        let pick = |v: Vec<(usize, usize)>| v.into_iter().map(|(_, i)| i).collect::<Vec<_>>();
        Ok((self.subset(&pick(pool)), self.subset(&pick(held_out))))
    }
}

/// Train and test splits of one dataset directory
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub train: Dataset,
    pub test: Dataset,
}

impl DatasetSplits {
    /// Load `train.jsonl` and `test.jsonl` from `data_dir`
    pub fn load(data_dir: impl AsRef<Path>, num_bias_classes: Option<usize>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let path = |name: &str| -> PathBuf { data_dir.join(name) };
        let train = Dataset::load_jsonl(path(TRAIN_FILE), num_bias_classes)?;
        let test = Dataset::load_jsonl(path(TEST_FILE), num_bias_classes)?;
        if train.input_dims() != test.input_dims() {
            return Err(Error::dataset(format!(
                "train inputs have {} features but test inputs have {}",
                train.input_dims(),
                test.input_dims()
            )));
        }
        info!(
            data_dir = %data_dir.display(),
            train = train.len(),
            test = test.len(),
            groups = train.num_groups(),
            "dataset loaded"
        );
        Ok(Self { train, test })
    }

    /// Groups discovered across both splits
    pub fn num_groups(&self) -> usize {
        self.train.num_groups().max(self.test.num_groups())
    }
}
