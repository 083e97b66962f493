//! Checkpoints of a training run
//!
//! One safetensors file holds both models' parameters, both optimizers'
//! buffers and the Bias Signal values; a JSON header in the safetensors
//! metadata carries the epoch counter, optimizer scalars and signal keys.
//! Files are written to a temporary name and renamed into place, so a
//! checkpoint on disk is always complete.

use crate::error::{Error, Result};
use crate::model::ModelPair;
use crate::nn::{Module, Param};
use crate::optim::{Optimizer, OptimizerState};
use crate::train::{BiasSignal, SignalKey};
use ndarray::Array2;
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Written when the best test accuracy improves
pub const BEST_CHECKPOINT: &str = "best.safetensors";
/// Written when training reaches `Done`
pub const FINAL_CHECKPOINT: &str = "final.safetensors";

const HEADER_KEY: &str = "sesgo";
const SAVED_AT_KEY: &str = "saved_at";
const CLASSIFIER_PREFIX: &str = "classifier/";
const PREDICTOR_PREFIX: &str = "bias_predictor/";
const MAIN_OPTIM_PREFIX: &str = "optim.main/";
const BIAS_OPTIM_PREFIX: &str = "optim.bias/";
const SIGNAL_TENSOR: &str = "signal";

/// Cadence checkpoint name for `epoch` completed epochs
pub fn epoch_checkpoint_name(epoch: usize) -> String {
    format!("epoch_{epoch}.safetensors")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OptimizerHeader {
    kind: String,
    lr: f32,
    step: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointHeader {
    epoch: usize,
    global_step: u64,
    best_test_accuracy: Option<f32>,
    model: String,
    bias_predictor: String,
    main_optimizer: OptimizerHeader,
    bias_optimizer: OptimizerHeader,
    signal_gamma: f32,
    signal_keys: Vec<SignalKey>,
}

/// Snapshot of everything needed to resume a run
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Completed epochs
    pub epoch: usize,
    pub global_step: u64,
    pub best_test_accuracy: Option<f32>,
    pub model: String,
    pub bias_predictor: String,
    pub classifier_params: BTreeMap<String, Array2<f32>>,
    pub predictor_params: BTreeMap<String, Array2<f32>>,
    pub main_optimizer: OptimizerState,
    pub bias_optimizer: OptimizerState,
    pub signal: BiasSignal,
}

fn snapshot(params: Vec<&Param>) -> BTreeMap<String, Array2<f32>> {
    params
        .into_iter()
        .map(|p| (p.name().to_string(), p.data().clone()))
        .collect()
}

fn restore_params(
    params: Vec<&mut Param>,
    stored: &BTreeMap<String, Array2<f32>>,
    owner: &str,
) -> Result<()> {
    if params.len() != stored.len() {
        return Err(Error::Serialization(format!(
            "checkpoint has {} {owner} tensors, model has {}",
            stored.len(),
            params.len()
        )));
    }
    for param in params {
        let value = stored.get(param.name()).ok_or_else(|| {
            Error::Serialization(format!("checkpoint is missing {owner} tensor '{}'", param.name()))
        })?;
        if value.dim() != param.shape() {
            return Err(Error::Serialization(format!(
                "{owner} tensor '{}' has shape {:?} in the checkpoint, {:?} in the model",
                param.name(),
                value.dim(),
                param.shape()
            )));
        }
        *param.data_mut() = value.clone();
        param.zero_grad();
    }
    Ok(())
}

fn to_bytes(array: &Array2<f32>) -> Vec<u8> {
    let values: Vec<f32> = array.iter().copied().collect();
    bytemuck::cast_slice(&values).to_vec()
}

impl Checkpoint {
    /// Capture the current state of a run
    pub fn capture(
        models: &ModelPair,
        main_optimizer: &dyn Optimizer,
        bias_optimizer: &dyn Optimizer,
        signal: &BiasSignal,
        epoch: usize,
        global_step: u64,
        best_test_accuracy: Option<f32>,
    ) -> Self {
        Self {
            epoch,
            global_step,
            best_test_accuracy,
            model: models.classifier.name().to_string(),
            bias_predictor: models.bias_predictor.name().to_string(),
            classifier_params: snapshot(models.classifier.parameters()),
            predictor_params: snapshot(models.bias_predictor.parameters()),
            main_optimizer: main_optimizer.export_state(),
            bias_optimizer: bias_optimizer.export_state(),
            signal: signal.clone(),
        }
    }

    /// Load parameters and optimizer buffers into a freshly built run
    ///
    /// Nothing is modified unless every tensor matches.
    pub fn restore_into(
        &self,
        models: &mut ModelPair,
        main_optimizer: &mut dyn Optimizer,
        bias_optimizer: &mut dyn Optimizer,
    ) -> Result<()> {
        if self.model != models.classifier.name() || self.bias_predictor != models.bias_predictor.name() {
            return Err(Error::Serialization(format!(
                "checkpoint is for {} + {}, run uses {} + {}",
                self.model,
                self.bias_predictor,
                models.classifier.name(),
                models.bias_predictor.name()
            )));
        }
        let mut staged = models.clone();
        restore_params(staged.classifier.parameters_mut(), &self.classifier_params, "classifier")?;
        restore_params(staged.bias_predictor.parameters_mut(), &self.predictor_params, "bias predictor")?;
        for (optimizer, state) in [
            (&*main_optimizer, &self.main_optimizer),
            (&*bias_optimizer, &self.bias_optimizer),
        ] {
            state.check_kind(&optimizer.export_state().kind)?;
            state.check_slots()?;
        }
        main_optimizer.import_state(&self.main_optimizer)?;
        bias_optimizer.import_state(&self.bias_optimizer)?;
        *models = staged;
        Ok(())
    }

    /// Encode as safetensors bytes
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let optimizer_header = |state: &OptimizerState| OptimizerHeader {
            kind: state.kind.clone(),
            lr: state.lr,
            step: state.step,
        };
        let (signal_keys, signal_values): (Vec<SignalKey>, Vec<f32>) = self.signal.iter().unzip();
        let header = CheckpointHeader {
            epoch: self.epoch,
            global_step: self.global_step,
            best_test_accuracy: self.best_test_accuracy,
            model: self.model.clone(),
            bias_predictor: self.bias_predictor.clone(),
            main_optimizer: optimizer_header(&self.main_optimizer),
            bias_optimizer: optimizer_header(&self.bias_optimizer),
            signal_gamma: self.signal.gamma(),
            signal_keys,
        };
        let header = serde_json::to_string(&header)
            .map_err(|e| Error::Serialization(format!("checkpoint header: {e}")))?;

        let mut tensors: Vec<(String, Vec<u8>, Vec<usize>)> = Vec::new();
        let mut push = |prefix: &str, map: &BTreeMap<String, Array2<f32>>| {
            for (name, value) in map {
                let (rows, cols) = value.dim();
                tensors.push((format!("{prefix}{name}"), to_bytes(value), vec![rows, cols]));
            }
        };
        push(CLASSIFIER_PREFIX, &self.classifier_params);
        push(PREDICTOR_PREFIX, &self.predictor_params);
        push(MAIN_OPTIM_PREFIX, &self.main_optimizer.slots);
        push(BIAS_OPTIM_PREFIX, &self.bias_optimizer.slots);
        if !signal_values.is_empty() {
            let n = signal_values.len();
            tensors.push((
                SIGNAL_TENSOR.to_string(),
                bytemuck::cast_slice(&signal_values).to_vec(),
                vec![n, 1],
            ));
        }

        let views = tensors
            .iter()
            .map(|(name, bytes, shape)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes)
                    .map(|view| (name.as_str(), view))
                    .map_err(|e| Error::Serialization(format!("tensor '{name}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut metadata = HashMap::new();
        metadata.insert(HEADER_KEY.to_string(), header);
        metadata.insert(SAVED_AT_KEY.to_string(), chrono::Utc::now().to_rfc3339());
        safetensors::serialize(views, Some(metadata))
            .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))
    }

    /// Decode safetensors bytes produced by [`Checkpoint::to_safetensors`]
    pub fn from_safetensors(data: &[u8]) -> Result<Self> {
        let (_, st_metadata) = SafeTensors::read_metadata(data)
            .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
        let header = st_metadata
            .metadata()
            .as_ref()
            .and_then(|m| m.get(HEADER_KEY))
            .ok_or_else(|| Error::Serialization("not a sesgo checkpoint (no header)".to_string()))?;
        let header: CheckpointHeader = serde_json::from_str(header)
            .map_err(|e| Error::Serialization(format!("checkpoint header: {e}")))?;

        let tensors = SafeTensors::deserialize(data)
            .map_err(|e| Error::Serialization(format!("SafeTensors parsing failed: {e}")))?;
        let mut classifier_params = BTreeMap::new();
        let mut predictor_params = BTreeMap::new();
        let mut main_slots = BTreeMap::new();
        let mut bias_slots = BTreeMap::new();
        let mut signal_values: Vec<f32> = Vec::new();

        for name in tensors.names() {
            let view = tensors
                .tensor(name)
                .map_err(|e| Error::Serialization(format!("tensor '{name}': {e}")))?;
            if view.dtype() != Dtype::F32 {
                return Err(Error::Serialization(format!("tensor '{name}' is not f32")));
            }
            let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
            if name == SIGNAL_TENSOR {
                signal_values = values;
                continue;
            }
            let shape = view.shape();
            let &[rows, cols] = shape else {
                return Err(Error::Serialization(format!(
                    "tensor '{name}' has rank {}, expected 2",
                    shape.len()
                )));
            };
            let array = Array2::from_shape_vec((rows, cols), values)
                .map_err(|e| Error::Serialization(format!("tensor '{name}': {e}")))?;
            let (map, key) = if let Some(key) = name.strip_prefix(CLASSIFIER_PREFIX) {
                (&mut classifier_params, key)
            } else if let Some(key) = name.strip_prefix(PREDICTOR_PREFIX) {
                (&mut predictor_params, key)
            } else if let Some(key) = name.strip_prefix(MAIN_OPTIM_PREFIX) {
                (&mut main_slots, key)
            } else if let Some(key) = name.strip_prefix(BIAS_OPTIM_PREFIX) {
                (&mut bias_slots, key)
            } else {
                return Err(Error::Serialization(format!("unexpected tensor '{name}'")));
            };
            map.insert(key.to_string(), array);
        }

        if signal_values.len() != header.signal_keys.len() {
            return Err(Error::Serialization(format!(
                "signal has {} keys but {} values",
                header.signal_keys.len(),
                signal_values.len()
            )));
        }
        let signal = BiasSignal::from_entries(
            header.signal_gamma,
            header.signal_keys.into_iter().zip(signal_values),
        );
        let optimizer_state = |h: OptimizerHeader, slots| OptimizerState {
            kind: h.kind,
            lr: h.lr,
            step: h.step,
            slots,
        };

        Ok(Self {
            epoch: header.epoch,
            global_step: header.global_step,
            best_test_accuracy: header.best_test_accuracy,
            model: header.model,
            bias_predictor: header.bias_predictor,
            classifier_params,
            predictor_params,
            main_optimizer: optimizer_state(header.main_optimizer, main_slots),
            bias_optimizer: optimizer_state(header.bias_optimizer, bias_slots),
            signal,
        })
    }
}

/// Directory of checkpoints for one run
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write `checkpoint` as `name`, replacing any previous file atomically
    pub fn save(&self, checkpoint: &Checkpoint, name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let bytes = checkpoint.to_safetensors()?;
        let target = self.path(name);
        let tmp = self.path(&format!(".{name}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &target)?;
        debug!(path = %target.display(), epoch = checkpoint.epoch, "checkpoint written");
        Ok(target)
    }

    /// Read a checkpoint file
    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        Checkpoint::from_safetensors(&data)
            .map_err(|e| Error::Serialization(format!("{}: {e}", path.display())))
    }
}
