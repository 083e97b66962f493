//! End-to-end trainer scenarios on small synthetic datasets

use sesgo::config::{resolve, NanPolicy, RunConfig, TrainSettings};
use sesgo::data::{DataLoaders, Dataset, DatasetSplits, SyntheticConfig};
use sesgo::io::{epoch_checkpoint_name, CheckpointStore, BEST_CHECKPOINT, FINAL_CHECKPOINT};
use sesgo::train::{BiasAwareTrainer, TrainerState};
use sesgo::Error;
use std::path::Path;

const INPUT_DIMS: usize = 8;

fn settings(save_dir: &Path, edit: impl FnOnce(&mut RunConfig)) -> TrainSettings {
    let mut config = RunConfig::new("biased_mnist", "/unused", save_dir, "scenario");
    config.random_seed = Some(21);
    config.batch_size = Some(32);
    config.num_envs_per_batch = Some(4);
    config.lr = Some(1e-2);
    config.epochs = Some(2);
    edit(&mut config);
    TrainSettings::from_config(&resolve(&config).unwrap()).unwrap()
}

/// `poison` puts a NaN into every training input
fn splits(poison: bool) -> DatasetSplits {
    let (mut train, test) = SyntheticConfig {
        train_size: 96,
        test_size: 32,
        input_dims: INPUT_DIMS,
        ..Default::default()
    }
    .generate();
    if poison {
        for sample in &mut train {
            sample.input[0] = f32::NAN;
        }
    }
    DatasetSplits {
        train: Dataset::from_samples(train, Some(10)).unwrap(),
        test: Dataset::from_samples(test, Some(10)).unwrap(),
    }
}

#[test]
fn zero_epochs_saves_initial_models() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), |c| c.epochs = Some(0));
    let loaders = DataLoaders::build(&settings, splits(false)).unwrap();

    let reference = BiasAwareTrainer::new(settings.clone(), INPUT_DIMS).unwrap().checkpoint();
    let mut trainer = BiasAwareTrainer::new(settings, INPUT_DIMS).unwrap();
    let report = trainer.train(&loaders).unwrap();

    assert_eq!(trainer.state(), TrainerState::Done);
    assert_eq!(report.epochs_completed, 0);
    assert!(report.metrics.epochs.is_empty());
    let saved = CheckpointStore::load(&report.final_checkpoint).unwrap();
    assert_eq!(saved.classifier_params, reference.classifier_params);
    assert_eq!(saved.predictor_params, reference.predictor_params);
    assert!(saved.signal.is_empty());
}

#[test]
fn nan_halt_leaves_last_checkpoint_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let clean = settings(dir.path(), |c| c.epochs = Some(1));
    let run_dir = clean.expt_dir.clone();
    let loaders = DataLoaders::build(&clean, splits(false)).unwrap();
    BiasAwareTrainer::new(clean, INPUT_DIMS).unwrap().train(&loaders).unwrap();
    let last = run_dir.join(epoch_checkpoint_name(1));
    let before = std::fs::read(&last).unwrap();

    let poisoned = settings(dir.path(), |c| {
        c.nan_policy = Some(NanPolicy::Halt);
        c.resume_from = Some(last.clone());
    });
    let loaders = DataLoaders::build(&poisoned, splits(true)).unwrap();
    let mut trainer = BiasAwareTrainer::new(poisoned, INPUT_DIMS).unwrap();
    let err = trainer.train(&loaders).unwrap_err();
    assert!(matches!(err, Error::NumericalInstability { epoch: 1, step: 0, .. }));
    assert_ne!(trainer.state(), TrainerState::Done);
    assert_eq!(std::fs::read(&last).unwrap(), before);
    assert!(!run_dir.join(epoch_checkpoint_name(2)).exists());
}

#[test]
fn nan_skip_drops_every_unstable_batch() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), |c| c.nan_policy = Some(NanPolicy::Skip));
    let loaders = DataLoaders::build(&settings, splits(true)).unwrap();

    let reference = BiasAwareTrainer::new(settings.clone(), INPUT_DIMS).unwrap().checkpoint();
    let mut trainer = BiasAwareTrainer::new(settings, INPUT_DIMS).unwrap();
    let report = trainer.train(&loaders).unwrap();
    assert_eq!(report.epochs_completed, 2);
    for record in &report.metrics.epochs {
        assert_eq!(record.train.steps, 0);
        assert_eq!(record.train.skipped_steps, 3);
    }
    let saved = CheckpointStore::load(&report.final_checkpoint).unwrap();
    assert_eq!(saved.global_step, 0);
    assert_eq!(saved.classifier_params, reference.classifier_params);
    assert!(saved.signal.is_empty());
}

#[test]
fn resume_matches_uninterrupted_run() {
    let straight_dir = tempfile::tempdir().unwrap();
    let straight = settings(straight_dir.path(), |_| {});
    let loaders = DataLoaders::build(&straight, splits(false)).unwrap();
    let mut trainer = BiasAwareTrainer::new(straight, INPUT_DIMS).unwrap();
    let uninterrupted = trainer.train(&loaders).unwrap();

    let split_dir = tempfile::tempdir().unwrap();
    let first_half = settings(split_dir.path(), |c| c.epochs = Some(1));
    let halfway = first_half.expt_dir.join(epoch_checkpoint_name(1));
    let mut trainer = BiasAwareTrainer::new(first_half, INPUT_DIMS).unwrap();
    trainer.train(&loaders).unwrap();
    assert!(halfway.is_file());

    let second_half = settings(split_dir.path(), |c| c.resume_from = Some(halfway.clone()));
    let mut trainer = BiasAwareTrainer::new(second_half, INPUT_DIMS).unwrap();
    let resumed = trainer.train(&loaders).unwrap();
    assert_eq!(resumed.epochs_completed, 2);
    assert_eq!(resumed.metrics.epochs.len(), 1);

    let a = CheckpointStore::load(&uninterrupted.final_checkpoint).unwrap();
    let b = CheckpointStore::load(&resumed.final_checkpoint).unwrap();
    assert_eq!(a.global_step, b.global_step);
    assert_eq!(a.classifier_params, b.classifier_params);
    assert_eq!(a.predictor_params, b.predictor_params);
    assert_eq!(a.signal, b.signal);
    assert_eq!(a.main_optimizer, b.main_optimizer);
}

#[test]
fn best_checkpoint_tracks_test_accuracy() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(dir.path(), |c| c.epochs = Some(3));
    let run_dir = settings.expt_dir.clone();
    let loaders = DataLoaders::build(&settings, splits(false)).unwrap();

    let mut trainer = BiasAwareTrainer::new(settings, INPUT_DIMS).unwrap();
    let report = trainer.train(&loaders).unwrap();
    let best = CheckpointStore::load(run_dir.join(BEST_CHECKPOINT)).unwrap();
    assert_eq!(best.best_test_accuracy, report.best_test_accuracy);
    assert_eq!(report.best_test_accuracy, report.metrics.best_test_accuracy());
}
