//! Bias-Aware Trainer
//!
//! Drives `Initializing -> Training(e) -> Evaluating(e) -> Checkpointing(e)
//! -> ... -> Done`. One step forwards the classifier, reads the configured
//! tap with the bias predictor, updates the Bias Signal, reweights the main
//! loss by it and steps each model's optimizer.

use super::early_stopping::EarlyStopping;
use super::metrics::{
    EpochRecord, EvalAccumulator, EvalMetrics, MetricsTracker, StepReport, TrainAccumulator,
};
use super::signal::{observe, BiasSignal, SignalKey};
use super::weighting::{example_weights, weighted_mean};
use crate::config::{NanPolicy, TrainSettings};
use crate::data::{Batch, DataLoaders, EnvironmentBatch};
use crate::error::{Error, Result};
use crate::io::{epoch_checkpoint_name, Checkpoint, CheckpointStore, BEST_CHECKPOINT, FINAL_CHECKPOINT};
use crate::model::ModelPair;
use crate::nn::loss::{argmax_rows, cross_entropy, cross_entropy_grad};
use crate::nn::Module;
use crate::optim::{build_optimizer, Optimizer};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Where the trainer is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Initializing,
    Training { epoch: usize },
    Evaluating { epoch: usize },
    Checkpointing { epoch: usize },
    Done,
}

/// Result of a training run
#[derive(Debug, Clone)]
pub struct TrainReport {
    /// Completed epochs (including those restored from a checkpoint)
    pub epochs_completed: usize,
    pub stopped_early: bool,
    pub best_test_accuracy: Option<f32>,
    pub final_checkpoint: PathBuf,
    pub metrics: MetricsTracker,
}

/// Trainer for the classifier / bias predictor pair
pub struct BiasAwareTrainer {
    settings: TrainSettings,
    models: ModelPair,
    main_optimizer: Box<dyn Optimizer>,
    bias_optimizer: Box<dyn Optimizer>,
    signal: BiasSignal,
    state: TrainerState,
    /// Completed epochs
    epoch: usize,
    global_step: u64,
    best_test_accuracy: Option<f32>,
    store: CheckpointStore,
    metrics: MetricsTracker,
}

impl BiasAwareTrainer {
    /// Build a trainer with freshly initialized models
    ///
    /// Model initialization draws from an RNG seeded with the run seed, so
    /// two trainers built from the same settings start identical.
    pub fn new(settings: TrainSettings, input_dims: usize) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(settings.seed);
        let models = ModelPair::new(&settings, input_dims, &mut rng)?;
        Self::with_models(settings, models)
    }

    /// Build a trainer around an existing model pair
    pub fn with_models(settings: TrainSettings, models: ModelPair) -> Result<Self> {
        let main_optimizer = build_optimizer(&settings.optim)?;
        let bias_optimizer = build_optimizer(&settings.optim)?;
        let signal = BiasSignal::new(settings.bias_ema_gamma);
        let store = CheckpointStore::new(settings.expt_dir.clone());
        Ok(Self {
            settings,
            models,
            main_optimizer,
            bias_optimizer,
            signal,
            state: TrainerState::Initializing,
            epoch: 0,
            global_step: 0,
            best_test_accuracy: None,
            store,
            metrics: MetricsTracker::new(),
        })
    }

    pub fn settings(&self) -> &TrainSettings {
        &self.settings
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn models(&self) -> &ModelPair {
        &self.models
    }

    pub fn signal(&self) -> &BiasSignal {
        &self.signal
    }

    /// Completed epochs
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Optimizer steps taken by the main classifier
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Snapshot of the current run state
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint::capture(
            &self.models,
            self.main_optimizer.as_ref(),
            self.bias_optimizer.as_ref(),
            &self.signal,
            self.epoch,
            self.global_step,
            self.best_test_accuracy,
        )
    }

    /// Continue from a checkpoint; training restarts at the next epoch
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.restore_into(
            &mut self.models,
            self.main_optimizer.as_mut(),
            self.bias_optimizer.as_mut(),
        )?;
        self.signal = BiasSignal::from_entries(
            self.settings.bias_ema_gamma,
            checkpoint.signal.iter(),
        );
        self.epoch = checkpoint.epoch;
        self.global_step = checkpoint.global_step;
        self.best_test_accuracy = checkpoint.best_test_accuracy;
        Ok(())
    }

    fn unstable(&self, epoch: usize, step: usize, metric: impl Into<String>) -> Error {
        Error::NumericalInstability {
            epoch,
            step,
            metric: metric.into(),
        }
    }

    /// One optimization step on an environment batch
    ///
    /// On error neither model, optimizer nor the Bias Signal has been
    /// modified.
    pub fn train_step(&mut self, batch: &EnvironmentBatch, epoch: usize, step: usize) -> Result<StepReport> {
        let rows = &batch.batch;
        let n = rows.len();
        if n == 0 {
            return Err(Error::dataset("empty training batch"));
        }
        self.models.classifier.zero_grad();
        self.models.bias_predictor.zero_grad();

        let pass = self.models.classifier.forward(&rows.inputs);
        let (ce, probs) = cross_entropy(pass.logits(), &rows.labels);
        let main_loss = ce.mean().unwrap_or_default();
        if !main_loss.is_finite() {
            return Err(self.unstable(epoch, step, "main_loss"));
        }

        let bias_cfg = &self.settings.bias_predictor;
        let mut weights = Array1::ones(n);
        let mut bias_step = None;
        if bias_cfg.enabled {
            let tap = self.models.tap();
            let features = pass
                .tap(tap)
                .ok_or_else(|| Error::config(format!("feature tap {tap} missing from forward pass")))?;
            let bias_pass = self.models.bias_predictor.predict(features);
            let bias_loss = self.models.bias_predictor.loss(&bias_pass, &rows.bias)?;
            let bias_mean = bias_loss.per_example.mean().unwrap_or_default();
            if !bias_mean.is_finite() {
                return Err(self.unstable(epoch, step, "bias_loss"));
            }

            let keys: Vec<SignalKey> = rows
                .groups
                .iter()
                .zip(&rows.labels)
                .map(|(&env, &label)| SignalKey::new(env, label))
                .collect();
            let losses: Vec<f32> = bias_loss.per_example.to_vec();
            let update = self.signal.stage(&observe(&keys, &losses));
            if !update.is_finite() {
                return Err(self.unstable(epoch, step, "bias_signal"));
            }
            let signals: Vec<f32> = keys
                .iter()
                .map(|k| update.get(k).unwrap_or_default())
                .collect();
            weights = example_weights(&signals, self.settings.bias_loss_gamma);
            bias_step = Some((tap, bias_pass, bias_loss, bias_mean, update));
        }

        let weighted_loss = weighted_mean(&ce, &weights);
        if !weighted_loss.is_finite() {
            return Err(self.unstable(epoch, step, "weighted_loss"));
        }
        let grad_logits = cross_entropy_grad(&probs, &rows.labels, &(&weights / n as f32));

        let mut bias_report = None;
        let mut signal_update = None;
        match bias_step {
            Some((tap, bias_pass, bias_loss, bias_mean, update)) => {
                let mean_weights = Array1::from_elem(n, 1.0 / n as f32);
                let grad_features =
                    self.models
                        .bias_predictor
                        .backward(&bias_pass, &bias_loss, &mean_weights);
                let tap_grad = bias_cfg.joint_backprop.then_some((tap, &grad_features));
                self.models.classifier.backward(&pass, &grad_logits, tap_grad);
                let correct = bias_loss
                    .correct
                    .as_ref()
                    .map(|c| c.iter().filter(|&&hit| hit).count());
                bias_report = Some((bias_mean, correct));
                signal_update = Some(update);
            }
            None => self.models.classifier.backward(&pass, &grad_logits, None),
        }

        if let Some(name) = self.models.classifier.first_non_finite() {
            return Err(self.unstable(epoch, step, format!("grad:{name}")));
        }
        if let Some(name) = self.models.bias_predictor.first_non_finite() {
            return Err(self.unstable(epoch, step, format!("grad:{name}")));
        }

        self.main_optimizer
            .step(&mut self.models.classifier.parameters_mut());
        if let Some(update) = signal_update {
            self.bias_optimizer
                .step(&mut self.models.bias_predictor.parameters_mut());
            self.signal.commit(update);
        }
        self.global_step += 1;

        let predicted = argmax_rows(&probs);
        let main_correct = predicted
            .iter()
            .zip(&rows.labels)
            .filter(|(p, t)| p == t)
            .count();
        Ok(StepReport {
            main_loss,
            weighted_loss,
            bias_loss: bias_report.map(|(loss, _)| loss),
            main_correct,
            bias_correct: bias_report.and_then(|(_, correct)| correct),
            examples: n,
        })
    }

    /// Classifier-only evaluation; mutates nothing
    pub fn evaluate(&self, batches: impl Iterator<Item = Batch>) -> EvalMetrics {
        let mut acc = EvalAccumulator::default();
        for batch in batches {
            if batch.is_empty() {
                continue;
            }
            let pass = self.models.classifier.forward(&batch.inputs);
            let (losses, probs) = cross_entropy(pass.logits(), &batch.labels);
            let predicted = argmax_rows(&probs);
            acc.record(&losses.to_vec(), &predicted, &batch.labels, &batch.groups);
        }
        acc.finish()
    }

    fn save(&self, name: &str) -> Result<PathBuf> {
        self.store.save(&self.checkpoint(), name).inspect_err(|e| {
            error!(epoch = self.epoch, checkpoint = name, error = %e, "checkpoint write failed");
        })
    }

    fn run_epoch(&mut self, loaders: &DataLoaders, epoch: usize) -> Result<EpochRecord> {
        self.state = TrainerState::Training { epoch };
        let mut acc = TrainAccumulator::default();
        let batches = loaders.train.epoch(epoch);
        let expected = batches.num_batches();
        let mut seen = 0;

        for (step, item) in batches.enumerate() {
            let batch = item.inspect_err(|e| {
                error!(epoch, step, error = %e, "data loading failed");
            })?;
            seen += 1;
            match self.train_step(&batch, epoch, step) {
                Ok(report) => acc.record(&report),
                Err(e @ Error::NumericalInstability { .. })
                    if self.settings.nan_policy == NanPolicy::Skip =>
                {
                    warn!(error = %e, "skipping unstable step");
                    acc.record_skip();
                }
                Err(e) => {
                    error!(epoch, step, error = %e, "training step failed");
                    return Err(e);
                }
            }
        }
        if seen < expected {
            let e = Error::dataset(format!(
                "train loader exhausted after {seen} of {expected} batches in epoch {epoch}"
            ));
            error!(epoch, error = %e, "data loading failed");
            return Err(e);
        }

        self.state = TrainerState::Evaluating { epoch };
        let completed = epoch + 1;
        let evaluate_now =
            completed % self.settings.test_every == 0 || completed == self.settings.epochs;
        let (test, unbalanced_train) = if evaluate_now {
            (
                Some(self.evaluate(loaders.test.epoch(epoch))),
                Some(self.evaluate(loaders.unbalanced_train.epoch(epoch))),
            )
        } else {
            (None, None)
        };
        Ok(EpochRecord {
            epoch: completed,
            train: acc.finish(),
            test,
            unbalanced_train,
        })
    }

    fn log_epoch(&self, record: &EpochRecord) {
        let train = &record.train;
        info!(
            epoch = record.epoch,
            main_loss = train.main_loss,
            weighted_loss = train.weighted_loss,
            bias_loss = ?train.bias_loss,
            main_acc = train.main_accuracy,
            bias_acc = ?train.bias_accuracy,
            skipped = train.skipped_steps,
            "train"
        );
        if let Some(test) = &record.test {
            info!(epoch = record.epoch, "test {test}");
        }
        if let Some(unbalanced) = &record.unbalanced_train {
            info!(epoch = record.epoch, "unbalanced_train {unbalanced}");
        }
    }

    /// Run the epoch loop to `Done`
    pub fn train(&mut self, loaders: &DataLoaders) -> Result<TrainReport> {
        self.state = TrainerState::Initializing;
        if let Some(path) = self.settings.resume_from.clone() {
            let checkpoint = CheckpointStore::load(&path)?;
            self.restore(&checkpoint)?;
            info!(
                path = %path.display(),
                epoch = self.epoch,
                signal_entries = self.signal.len(),
                "resumed from checkpoint"
            );
        }
        let mut early_stopping = self.settings.patience.map(|patience| {
            let es = EarlyStopping::new(patience, 0.0);
            match self.best_test_accuracy {
                Some(best) => es.with_best(best),
                None => es,
            }
        });

        info!(
            model = %self.settings.model,
            parameters = self.models.classifier.num_parameters(),
            bias_predictor = %self.settings.bias_predictor.arch,
            tap = %self.settings.bias_predictor.in_layer,
            epochs = self.settings.epochs,
            start_epoch = self.epoch,
            "training started"
        );

        let mut stopped_early = false;
        for epoch in self.epoch..self.settings.epochs {
            let record = self.run_epoch(loaders, epoch)?;
            self.epoch = record.epoch;
            self.log_epoch(&record);

            self.state = TrainerState::Checkpointing { epoch };
            let test_accuracy = record.test.as_ref().map(|t| t.accuracy);
            let improved = test_accuracy
                .is_some_and(|acc| self.best_test_accuracy.is_none_or(|best| acc > best));
            if improved {
                self.best_test_accuracy = test_accuracy;
            }
            if self.epoch % self.settings.save_every == 0 {
                self.save(&epoch_checkpoint_name(self.epoch))?;
            }
            if improved {
                let path = self.save(BEST_CHECKPOINT)?;
                debug!(path = %path.display(), accuracy = ?test_accuracy, "new best checkpoint");
            }
            self.metrics.record_epoch(record);

            if let (Some(es), Some(acc)) = (early_stopping.as_mut(), test_accuracy) {
                if es.should_stop(acc) {
                    info!(epoch = self.epoch, best = ?es.best(), "early stopping");
                    stopped_early = true;
                    break;
                }
            }
        }

        self.state = TrainerState::Done;
        let final_checkpoint = self.save(FINAL_CHECKPOINT)?;
        info!(
            epochs = self.epoch,
            steps = self.global_step,
            best_test_acc = ?self.best_test_accuracy,
            "training done"
        );
        Ok(TrainReport {
            epochs_completed: self.epoch,
            stopped_early,
            best_test_accuracy: self.best_test_accuracy,
            final_checkpoint,
            metrics: self.metrics.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve, RunConfig};
    use crate::data::{BiasTargets, Dataset, DatasetSplits, EnvironmentLoader, SyntheticConfig};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn settings(dir: &std::path::Path, edit: impl FnOnce(&mut RunConfig)) -> TrainSettings {
        let mut config = RunConfig::new("biased_mnist", "/data", dir, "unit");
        config.random_seed = Some(11);
        config.batch_size = Some(32);
        config.num_envs_per_batch = Some(4);
        config.lr = Some(1e-2);
        config.epochs = Some(2);
        edit(&mut config);
        TrainSettings::from_config(&resolve(&config).unwrap()).unwrap()
    }

    fn splits() -> DatasetSplits {
        let synth = SyntheticConfig {
            train_size: 96,
            test_size: 32,
            input_dims: 8,
            ..Default::default()
        };
        let (train, test) = synth.generate();
        DatasetSplits {
            train: Dataset::from_samples(train, Some(10)).unwrap(),
            test: Dataset::from_samples(test, Some(10)).unwrap(),
        }
    }

    fn first_batch(settings: &TrainSettings) -> EnvironmentBatch {
        let pool = Arc::new(splits().train);
        EnvironmentLoader::new(pool, settings.batch_size, settings.num_envs_per_batch, 0)
            .unwrap()
            .epoch(0)
            .next()
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_step_updates_signal_and_models() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), |_| {});
        let batch = first_batch(&settings);
        let mut trainer = BiasAwareTrainer::new(settings, 8).unwrap();
        let before = trainer.checkpoint();

        let report = trainer.train_step(&batch, 0, 0).unwrap();
        assert_eq!(report.examples, 32);
        assert!(report.weighted_loss >= report.main_loss);
        assert!(report.bias_loss.is_some());
        assert!(!trainer.signal().is_empty());
        assert_eq!(trainer.global_step(), 1);
        let after = trainer.checkpoint();
        assert_ne!(after.classifier_params, before.classifier_params);
        assert_ne!(after.predictor_params, before.predictor_params);
    }

    #[test]
    fn test_zero_gamma_loss_is_plain_cross_entropy() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), |c| c.bias_loss_gamma = Some(0.0));
        let batch = first_batch(&settings);
        let mut trainer = BiasAwareTrainer::new(settings, 8).unwrap();
        let report = trainer.train_step(&batch, 0, 0).unwrap();
        assert_relative_eq!(report.weighted_loss, report.main_loss, epsilon = 1e-6);
    }

    #[test]
    fn test_nan_step_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), |_| {});
        let mut batch = first_batch(&settings);
        batch.batch.inputs[[0, 0]] = f32::NAN;
        let mut trainer = BiasAwareTrainer::new(settings, 8).unwrap();
        let before = trainer.checkpoint();

        let err = trainer.train_step(&batch, 3, 5).unwrap_err();
        assert!(matches!(
            err,
            Error::NumericalInstability { epoch: 3, step: 5, .. }
        ));
        assert_eq!(trainer.checkpoint(), before);
    }

    #[test]
    fn test_disabled_predictor_skips_signal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), |c| c.bias_predictor_enabled = Some(false));
        let batch = first_batch(&settings);
        let mut trainer = BiasAwareTrainer::new(settings, 8).unwrap();
        let before = trainer.checkpoint();
        let report = trainer.train_step(&batch, 0, 0).unwrap();
        assert_eq!(report.bias_loss, None);
        assert_relative_eq!(report.weighted_loss, report.main_loss, epsilon = 1e-6);
        assert!(trainer.signal().is_empty());
        assert_eq!(trainer.checkpoint().predictor_params, before.predictor_params);
    }

    #[test]
    fn test_joint_backprop_changes_classifier_update() {
        let dir = tempfile::tempdir().unwrap();
        let plain = settings(dir.path(), |_| {});
        let joint = settings(dir.path(), |c| c.joint_bias_backprop = Some(true));
        let batch = first_batch(&plain);
        let mut a = BiasAwareTrainer::new(plain, 8).unwrap();
        let mut b = BiasAwareTrainer::new(joint, 8).unwrap();
        a.train_step(&batch, 0, 0).unwrap();
        b.train_step(&batch, 0, 0).unwrap();
        let (ca, cb) = (a.checkpoint(), b.checkpoint());
        // layers after the tap see the same gradient, layers before it differ
        assert_eq!(ca.classifier_params["logits.weight"], cb.classifier_params["logits.weight"]);
        assert_ne!(ca.classifier_params["conv1.weight"], cb.classifier_params["conv1.weight"]);
    }

    #[test]
    fn test_evaluate_is_pure() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), |_| {});
        let trainer = BiasAwareTrainer::new(settings, 8).unwrap();
        let before = trainer.checkpoint();
        let test = Arc::new(splits().test);
        let metrics = trainer.evaluate(crate::data::EvalLoader::sequential(test, 10).epoch(0));
        assert_eq!(metrics.examples, 32);
        assert!((0.0..=1.0).contains(&metrics.accuracy));
        assert!(metrics.worst_group_accuracy <= metrics.mean_group_accuracy);
        assert_eq!(trainer.checkpoint(), before);
    }

    #[test]
    fn test_bias_kind_mismatch_is_dataset_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), |_| {});
        let mut batch = first_batch(&settings);
        batch.batch.bias = BiasTargets::Values(ndarray::Array2::zeros((32, 2)));
        let mut trainer = BiasAwareTrainer::new(settings, 8).unwrap();
        assert!(matches!(
            trainer.train_step(&batch, 0, 0),
            Err(Error::Dataset(_))
        ));
    }

    #[test]
    fn test_train_runs_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path(), |_| {});
        let loaders = DataLoaders::build(&settings, splits()).unwrap();
        let mut trainer = BiasAwareTrainer::new(settings, 8).unwrap();
        let report = trainer.train(&loaders).unwrap();
        assert_eq!(trainer.state(), TrainerState::Done);
        assert_eq!(report.epochs_completed, 2);
        assert_eq!(report.metrics.epochs.len(), 2);
        assert_eq!(report.metrics.steps, 6);
        for name in ["epoch_1.safetensors", "epoch_2.safetensors", "final.safetensors", "best.safetensors"] {
            assert!(trainer.store().path(name).exists(), "{name}");
        }
    }
}
