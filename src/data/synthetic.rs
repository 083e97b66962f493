//! Synthetic Biased-MNIST-like data
//!
//! Each class has a prototype vector and each bias class a "color"
//! prototype; an input is the sum of its class and bias prototypes plus
//! noise. In the training split the bias class equals `label % num_bias_classes`
//! with probability `rho`, otherwise it is drawn uniformly; the test split is
//! always uniform.

use super::dataset::{TEST_FILE, TRAIN_FILE};
use super::sample::{BiasAnnotation, Sample};
use crate::error::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use std::path::Path;

/// Parameters of a synthetic biased dataset
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    pub num_classes: usize,
    pub num_bias_classes: usize,
    pub input_dims: usize,
    pub train_size: usize,
    pub test_size: usize,
    /// Label/bias correlation in the training split
    pub rho: f32,
    pub noise: f32,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            num_bias_classes: 10,
            input_dims: 16,
            train_size: 512,
            test_size: 128,
            rho: 0.99,
            noise: 0.1,
            seed: 0,
        }
    }
}

impl SyntheticConfig {
    /// Generate `(train, test)` samples
    pub fn generate(&self) -> (Vec<Sample>, Vec<Sample>) {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut prototypes = |n: usize| -> Vec<Vec<f32>> {
            (0..n)
                .map(|_| (0..self.input_dims).map(|_| rng.random_range(-1.0..1.0)).collect())
                .collect()
        };
        let class_protos = prototypes(self.num_classes);
        let bias_protos = prototypes(self.num_bias_classes);

        let draw = |rho: f32, rng: &mut StdRng| -> Sample {
            let label = rng.random_range(0..self.num_classes);
            let bias = if rng.random::<f32>() < rho {
                label % self.num_bias_classes
            } else {
                rng.random_range(0..self.num_bias_classes)
            };
            let input = class_protos[label]
                .iter()
                .zip(&bias_protos[bias])
                .map(|(c, b)| c + b + self.noise * rng.random_range(-1.0..1.0))
                .collect();
            Sample {
                input,
                label,
                bias: BiasAnnotation::Class(bias),
                group: None,
            }
        };

        let train = (0..self.train_size).map(|_| draw(self.rho, &mut rng)).collect();
        let test = (0..self.test_size).map(|_| draw(0.0, &mut rng)).collect();
        (train, test)
    }

    /// Generate and write `train.jsonl` and `test.jsonl` into `dir`
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let (train, test) = self.generate();
        write_jsonl(&dir.join(TRAIN_FILE), &train)?;
        write_jsonl(&dir.join(TEST_FILE), &test)?;
        Ok(())
    }
}

/// Write samples one JSON object per line
pub fn write_jsonl(path: &Path, samples: &[Sample]) -> Result<()> {
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    for sample in samples {
        let line = serde_json::to_string(sample)
            .map_err(|e| crate::error::Error::Serialization(e.to_string()))?;
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, DatasetSplits};

    #[test]
    fn test_train_split_is_biased() {
        let cfg = SyntheticConfig {
            train_size: 400,
            rho: 0.95,
            ..Default::default()
        };
        let (train, test) = cfg.generate();
        assert_eq!(train.len(), 400);
        assert_eq!(test.len(), cfg.test_size);
        let aligned = train
            .iter()
            .filter(|s| s.bias == BiasAnnotation::Class(s.label % cfg.num_bias_classes))
            .count();
        assert!(aligned as f32 / 400.0 > 0.85);
    }

    #[test]
    fn test_generation_is_seeded() {
        let cfg = SyntheticConfig::default();
        assert_eq!(cfg.generate(), cfg.generate());
        let other = SyntheticConfig { seed: 1, ..cfg.clone() };
        assert_ne!(cfg.generate().0, other.generate().0);
    }

    #[test]
    fn test_written_files_load() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = SyntheticConfig {
            train_size: 20,
            test_size: 5,
            ..Default::default()
        };
        cfg.write_to(dir.path()).unwrap();
        let splits = DatasetSplits::load(dir.path(), Some(cfg.num_bias_classes)).unwrap();
        assert_eq!(splits.train.len(), 20);
        assert_eq!(splits.test.input_dims(), cfg.input_dims);
        let direct = Dataset::from_samples(cfg.generate().0, Some(cfg.num_bias_classes)).unwrap();
        assert_eq!(direct.environments(), splits.train.environments());
    }
}
