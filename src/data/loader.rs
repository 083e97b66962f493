//! Environment-batched data loader
//!
//! `Train` batches are built from `k` distinct environments with a near
//! equal share of rows each, so rare (label, bias) combinations are
//! oversampled. Every epoch's order depends only on `(seed, epoch)`.

use super::dataset::{Dataset, DatasetSplits};
use super::sample::{Batch, EnvironmentBatch};
use crate::config::TrainSettings;
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Stream offset separating the unbalanced loader's shuffles from the train loader's
const UNBALANCED_STREAM: u64 = 0x5EED_0F_B1A5;

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed ^ (epoch as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Indices of one environment's samples
#[derive(Debug, Clone)]
struct Environment {
    id: usize,
    members: Vec<usize>,
}

/// Loader producing environment batches
#[derive(Debug, Clone)]
pub struct EnvironmentLoader {
    dataset: Arc<Dataset>,
    environments: Arc<Vec<Environment>>,
    batch_size: usize,
    envs_per_batch: usize,
    seed: u64,
    prefetch: usize,
}

impl EnvironmentLoader {
    pub fn new(dataset: Arc<Dataset>, batch_size: usize, envs_per_batch: usize, seed: u64) -> Result<Self> {
        if envs_per_batch == 0 || batch_size < envs_per_batch {
            return Err(Error::config(format!(
                "batch_size {batch_size} cannot hold {envs_per_batch} non-empty environments"
            )));
        }
        let mut by_env: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &env) in dataset.environments().iter().enumerate() {
            by_env.entry(env).or_default().push(i);
        }
        if by_env.len() < envs_per_batch {
            return Err(Error::dataset(format!(
                "only {} non-empty environments, but {envs_per_batch} are needed per batch",
                by_env.len()
            )));
        }
        let environments = by_env
            .into_iter()
            .map(|(id, members)| Environment { id, members })
            .collect();
        Ok(Self {
            dataset,
            environments: Arc::new(environments),
            batch_size,
            envs_per_batch,
            seed,
            prefetch: 0,
        })
    }

    /// Produce batches on a background thread, up to `batches` ahead
    pub fn with_prefetch(mut self, batches: usize) -> Self {
        self.prefetch = batches;
        self
    }

    /// Batches per epoch: `ceil(pool / batch_size)`
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn num_environments(&self) -> usize {
        self.environments.len()
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Fresh pass over epoch `epoch`
    pub fn epoch(&self, epoch: usize) -> EnvironmentEpoch {
        let expected = self.num_batches();
        let mut sampler = EpochSampler::new(self, epoch);
        let source = if self.prefetch == 0 {
            EpochSource::Direct(Box::new(sampler))
        } else {
            let (tx, rx) = sync_channel(self.prefetch);
            thread::spawn(move || {
                for _ in 0..expected {
                    if tx.send(sampler.next_batch()).is_err() {
                        // consumer went away
                        break;
                    }
                }
            });
            EpochSource::Prefetched(rx)
        };
        EnvironmentEpoch {
            source,
            expected,
            produced: 0,
        }
    }
}

struct Cursor {
    order: Vec<usize>,
    pos: usize,
}

struct EpochSampler {
    dataset: Arc<Dataset>,
    environments: Arc<Vec<Environment>>,
    cursors: Vec<Cursor>,
    rng: StdRng,
    batch_size: usize,
    envs_per_batch: usize,
}

impl EpochSampler {
    fn new(loader: &EnvironmentLoader, epoch: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(epoch_seed(loader.seed, epoch));
        let cursors = loader
            .environments
            .iter()
            .map(|env| {
                let mut order = env.members.clone();
                order.shuffle(&mut rng);
                Cursor { order, pos: 0 }
            })
            .collect();
        Self {
            dataset: Arc::clone(&loader.dataset),
            environments: Arc::clone(&loader.environments),
            cursors,
            rng,
            batch_size: loader.batch_size,
            envs_per_batch: loader.envs_per_batch,
        }
    }

    /// Next member of environment `slot`, reshuffling when it is used up
    fn draw(&mut self, slot: usize) -> usize {
        let cursor = &mut self.cursors[slot];
        if cursor.pos == cursor.order.len() {
            cursor.order.shuffle(&mut self.rng);
            cursor.pos = 0;
        }
        cursor.pos += 1;
        cursor.order[cursor.pos - 1]
    }

    fn next_batch(&mut self) -> EnvironmentBatch {
        let k = self.envs_per_batch;
        let mut slots: Vec<usize> = (0..self.environments.len()).collect();
        slots.shuffle(&mut self.rng);
        slots.truncate(k);

        let base = self.batch_size / k;
        let extra = self.batch_size % k;
        let mut indices = Vec::with_capacity(self.batch_size);
        let mut environments = Vec::with_capacity(k);
        let mut sizes = Vec::with_capacity(k);
        for (j, &slot) in slots.iter().enumerate() {
            let size = base + usize::from(j < extra);
            for _ in 0..size {
                let index = self.draw(slot);
                indices.push(index);
            }
            environments.push(self.environments[slot].id);
            sizes.push(size);
        }

        EnvironmentBatch {
            batch: Batch::gather(&self.dataset, &indices),
            environments,
            sizes,
        }
    }
}

enum EpochSource {
    Direct(Box<EpochSampler>),
    Prefetched(Receiver<EnvironmentBatch>),
}

/// One epoch of environment batches
///
/// Yields exactly [`EnvironmentEpoch::num_batches`] items; a producer that
/// stops early surfaces as a `Dataset` error.
pub struct EnvironmentEpoch {
    source: EpochSource,
    expected: usize,
    produced: usize,
}

impl EnvironmentEpoch {
    pub fn num_batches(&self) -> usize {
        self.expected
    }
}

impl Iterator for EnvironmentEpoch {
    type Item = Result<EnvironmentBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.produced >= self.expected {
            return None;
        }
        let item = match &mut self.source {
            EpochSource::Direct(sampler) => Ok(sampler.next_batch()),
            EpochSource::Prefetched(rx) => rx.recv().map_err(|_| {
                Error::dataset(format!(
                    "loader stopped after {} of {} batches",
                    self.produced, self.expected
                ))
            }),
        };
        self.produced = if item.is_ok() {
            self.produced + 1
        } else {
            self.expected
        };
        Some(item)
    }
}

/// Plain batches without environment structure
#[derive(Debug, Clone)]
pub struct EvalLoader {
    dataset: Arc<Dataset>,
    batch_size: usize,
    shuffle_seed: Option<u64>,
}

impl EvalLoader {
    /// Batches in dataset order
    pub fn sequential(dataset: Arc<Dataset>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle_seed: None,
        }
    }

    /// Batches in a fresh seeded order every epoch
    pub fn shuffled(dataset: Arc<Dataset>, batch_size: usize, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle_seed: Some(seed),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn epoch(&self, epoch: usize) -> impl Iterator<Item = Batch> + '_ {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(epoch_seed(seed, epoch)));
        }
        let chunks: Vec<Vec<usize>> = order.chunks(self.batch_size).map(<[usize]>::to_vec).collect();
        chunks
            .into_iter()
            .map(move |chunk| Batch::gather(&self.dataset, &chunk))
    }
}

/// The three batch sources of a run
#[derive(Debug, Clone)]
pub struct DataLoaders {
    pub train: EnvironmentLoader,
    pub test: EvalLoader,
    pub unbalanced_train: EvalLoader,
}

impl DataLoaders {
    /// Build loaders for a run; with cross-validation the held-out fold of
    /// the training split replaces the test split.
    pub fn build(settings: &TrainSettings, splits: DatasetSplits) -> Result<Self> {
        let DatasetSplits { train, test } = splits;
        let (pool, test) = match settings.cross_validation {
            Some((folds, fold)) => {
                debug!(folds, fold, "using cross-validation split");
                train.split_fold(folds, fold, settings.seed)?
            }
            None => (train, test),
        };
        let variable = settings.bias_predictor.variable;
        pool.check_annotations(settings.num_classes, variable)?;
        test.check_annotations(settings.num_classes, variable)?;

        let pool = Arc::new(pool);
        let train = EnvironmentLoader::new(
            Arc::clone(&pool),
            settings.batch_size,
            settings.num_envs_per_batch,
            settings.seed,
        )?
        .with_prefetch(settings.prefetch_batches);
        let unbalanced_train = EvalLoader::shuffled(
            Arc::clone(&pool),
            settings.batch_size,
            settings.seed ^ UNBALANCED_STREAM,
        );
        let test = EvalLoader::sequential(Arc::new(test), settings.batch_size);

        info!(
            train = pool.len(),
            test = test.dataset().len(),
            environments = train.num_environments(),
            batches_per_epoch = train.num_batches(),
            "data loaders ready"
        );
        Ok(Self {
            train,
            test,
            unbalanced_train,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BiasAnnotation, Sample};
    use std::collections::BTreeSet;

    /// 4 environments of sizes 1, 2, 3 and 10
    fn dataset() -> Arc<Dataset> {
        let mut samples = Vec::new();
        for (env, count) in [(0, 1), (1, 2), (2, 3), (3, 10)] {
            for i in 0..count {
                samples.push(Sample {
                    input: vec![env as f32, i as f32],
                    label: env / 2,
                    bias: BiasAnnotation::Class(env % 2),
                    group: None,
                });
            }
        }
        Arc::new(Dataset::from_samples(samples, Some(2)).unwrap())
    }

    #[test]
    fn test_epoch_shape() {
        let loader = EnvironmentLoader::new(dataset(), 5, 3, 1).unwrap();
        assert_eq!(loader.num_batches(), 4);
        let batches: Vec<_> = loader.epoch(0).collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 4);
        for b in &batches {
            assert_eq!(b.batch.len(), 5);
            assert_eq!(b.sizes, vec![2, 2, 1]);
            let distinct: BTreeSet<_> = b.environments.iter().collect();
            assert_eq!(distinct.len(), 3);
            for (env, span) in b.spans() {
                assert!(b.batch.groups[span].iter().all(|g| *g == env));
            }
        }
    }

    #[test]
    fn test_epoch_is_deterministic_and_restartable() {
        let loader = EnvironmentLoader::new(dataset(), 4, 2, 7).unwrap();
        let a: Vec<_> = loader.epoch(3).collect::<Result<_>>().unwrap();
        let b: Vec<_> = loader.epoch(3).collect::<Result<_>>().unwrap();
        let c: Vec<_> = loader.epoch(4).collect::<Result<_>>().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_prefetch_preserves_order() {
        let loader = EnvironmentLoader::new(dataset(), 4, 2, 7).unwrap();
        let direct: Vec<_> = loader.epoch(1).collect::<Result<_>>().unwrap();
        let prefetched: Vec<_> = loader
            .clone()
            .with_prefetch(2)
            .epoch(1)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(direct, prefetched);
    }

    #[test]
    fn test_small_environment_is_oversampled() {
        let loader = EnvironmentLoader::new(dataset(), 16, 4, 3).unwrap();
        let batch = loader.epoch(0).next().unwrap().unwrap();
        // every environment is present, even the single-sample one
        assert_eq!(batch.sizes, vec![4, 4, 4, 4]);
        assert_eq!(batch.batch.groups.iter().filter(|g| **g == 0).count(), 4);
    }

    #[test]
    fn test_too_few_environments() {
        let err = EnvironmentLoader::new(dataset(), 10, 5, 0).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_eval_loader_covers_dataset() {
        let ds = dataset();
        let sequential = EvalLoader::sequential(Arc::clone(&ds), 5);
        let sizes: Vec<_> = sequential.epoch(0).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![5, 5, 5, 1]);
        assert_eq!(sequential.num_batches(), 4);

        let shuffled = EvalLoader::shuffled(ds, 16, 2);
        let rows: Vec<f32> = shuffled.epoch(0).flat_map(|b| b.inputs.column(1).to_vec()).collect();
        assert_eq!(rows.len(), 16);
        let first = shuffled.epoch(0).next().unwrap();
        let again = shuffled.epoch(0).next().unwrap();
        assert_eq!(first, again);
    }
}
