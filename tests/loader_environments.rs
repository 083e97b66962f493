//! Environment batching through the public loader API

use sesgo::data::{
    BiasAnnotation, Dataset, EnvironmentLoader, EvalLoader, Sample, SyntheticConfig,
};
use sesgo::Error;
use std::collections::BTreeSet;
use std::sync::Arc;

fn grouped(groups: &[(usize, usize)]) -> Arc<Dataset> {
    // (group id, members)
    let samples = groups
        .iter()
        .flat_map(|&(group, n)| {
            (0..n).map(move |i| Sample {
                input: vec![group as f32, i as f32],
                label: group % 2,
                bias: BiasAnnotation::Class(group % 3),
                group: Some(group),
            })
        })
        .collect();
    Arc::new(Dataset::from_samples(samples, Some(3)).unwrap())
}

#[test]
fn every_batch_has_k_distinct_nonempty_environments() {
    let dataset = grouped(&[(0, 5), (1, 40), (2, 3), (3, 12), (4, 9)]);
    let loader = EnvironmentLoader::new(Arc::clone(&dataset), 10, 3, 7).unwrap();
    assert_eq!(loader.num_batches(), 7);

    let batches: Vec<_> = loader.epoch(0).collect::<Result<_, _>>().unwrap();
    assert_eq!(batches.len(), 7);
    for batch in &batches {
        assert_eq!(batch.batch.len(), 10);
        assert_eq!(batch.num_environments(), 3);
        let distinct: BTreeSet<_> = batch.environments.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert!(batch.sizes.iter().all(|&s| s > 0));
        assert_eq!(batch.sizes.iter().sum::<usize>(), 10);
        // rows of a span all belong to that span's environment
        for (env, span) in batch.spans() {
            for row in span {
                assert_eq!(batch.batch.groups[row], env);
            }
        }
    }
}

#[test]
fn epochs_are_reproducible_and_distinct() {
    let dataset = grouped(&[(0, 20), (1, 20), (2, 20), (3, 20)]);
    let loader = EnvironmentLoader::new(dataset, 8, 2, 3).unwrap();
    let inputs = |epoch| -> Vec<_> {
        loader
            .epoch(epoch)
            .map(|b| b.unwrap().batch.inputs)
            .collect()
    };
    assert_eq!(inputs(0), inputs(0));
    assert_ne!(inputs(0), inputs(1));
}

#[test]
fn prefetching_yields_the_same_batches() {
    let dataset = grouped(&[(0, 16), (1, 16), (2, 16), (3, 16)]);
    let direct = EnvironmentLoader::new(Arc::clone(&dataset), 8, 4, 5).unwrap();
    let prefetched = EnvironmentLoader::new(dataset, 8, 4, 5)
        .unwrap()
        .with_prefetch(2);
    let a: Vec<_> = direct.epoch(2).map(|b| b.unwrap().batch.inputs).collect();
    let b: Vec<_> = prefetched.epoch(2).map(|b| b.unwrap().batch.inputs).collect();
    assert_eq!(a, b);
}

#[test]
fn too_few_environments_is_a_dataset_error() {
    let dataset = grouped(&[(0, 10), (1, 10)]);
    let err = EnvironmentLoader::new(dataset, 8, 3, 0).unwrap_err();
    assert!(matches!(err, Error::Dataset(_)));
}

#[test]
fn eval_loader_visits_every_sample_once() {
    let (train, _) = SyntheticConfig {
        train_size: 50,
        ..Default::default()
    }
    .generate();
    let dataset = Arc::new(Dataset::from_samples(train, Some(10)).unwrap());
    let loader = EvalLoader::shuffled(Arc::clone(&dataset), 16, 1);
    assert_eq!(loader.num_batches(), 4);
    let total: usize = loader.epoch(0).map(|b| b.len()).sum();
    assert_eq!(total, 50);

    let sequential = EvalLoader::sequential(dataset, 16);
    let labels: Vec<usize> = sequential.epoch(0).flat_map(|b| b.labels).collect();
    assert_eq!(labels.len(), 50);
}
