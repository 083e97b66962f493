//! Optimizer trait and exportable optimizer state

use crate::error::{Error, Result};
use crate::nn::Param;
use ndarray::Array2;
use std::collections::BTreeMap;

/// Snapshot of an optimizer, as stored in checkpoints
///
/// `slots` holds the per-parameter buffers keyed `"<buffer>.<index>"`
/// (e.g. `m.0`, `v.3`); parameters that never received a gradient have no
/// slot.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub kind: String,
    pub lr: f32,
    pub step: u64,
    pub slots: BTreeMap<String, Array2<f32>>,
}

impl OptimizerState {
    pub(crate) fn new(kind: &str, lr: f32, step: u64) -> Self {
        Self {
            kind: kind.to_string(),
            lr,
            step,
            slots: BTreeMap::new(),
        }
    }

    pub(crate) fn export_buffers(&mut self, prefix: &str, buffers: &[Option<Array2<f32>>]) {
        for (i, buf) in buffers.iter().enumerate() {
            if let Some(buf) = buf {
                self.slots.insert(format!("{prefix}.{i}"), buf.clone());
            }
        }
    }

    pub(crate) fn import_buffers(&self, prefix: &str) -> Result<Vec<Option<Array2<f32>>>> {
        let mut buffers: Vec<Option<Array2<f32>>> = Vec::new();
        for (key, value) in &self.slots {
            let Some(index) = key.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('.')) else {
                continue;
            };
            let index: usize = index
                .parse()
                .map_err(|_| Error::Serialization(format!("bad optimizer slot name '{key}'")))?;
            if buffers.len() <= index {
                buffers.resize(index + 1, None);
            }
            buffers[index] = Some(value.clone());
        }
        Ok(buffers)
    }

    /// Every slot key must read `<buffer>.<index>`
    pub(crate) fn check_slots(&self) -> Result<()> {
        for key in self.slots.keys() {
            let index = key.rsplit_once('.').map(|(_, index)| index);
            if index.map_or(true, |index| index.parse::<usize>().is_err()) {
                return Err(Error::Serialization(format!("bad optimizer slot name '{key}'")));
            }
        }
        Ok(())
    }

    pub(crate) fn check_kind(&self, expected: &str) -> Result<()> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(Error::Serialization(format!(
                "optimizer state is for {}, not {expected}",
                self.kind
            )))
        }
    }
}

/// Trait for optimization algorithms
///
/// Buffers are matched to parameters by position, so callers must pass the
/// parameters in the same order on every step (see `Module::parameters_mut`).
pub trait Optimizer: Send {
    /// Perform a single optimization step
    fn step(&mut self, params: &mut [&mut Param]);

    /// Zero out all gradients
    fn zero_grad(&mut self, params: &mut [&mut Param]) {
        for param in params {
            param.zero_grad();
        }
    }

    /// Get learning rate
    fn lr(&self) -> f32;

    /// Set learning rate
    fn set_lr(&mut self, lr: f32);

    /// Number of steps taken so far
    fn steps(&self) -> u64;

    /// Capture the state needed to resume
    fn export_state(&self) -> OptimizerState;

    /// Restore a state produced by [`Optimizer::export_state`]
    fn import_state(&mut self, state: &OptimizerState) -> Result<()>;
}
