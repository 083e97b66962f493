//! Bias Signal: EMA of the bias predictor's loss per (environment, class)
//!
//! Updates are staged: [`BiasSignal::stage`] computes the post-update
//! values without touching the table, and [`BiasSignal::commit`] applies
//! them once the step has proven numerically sound.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key of one signal entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignalKey {
    pub environment: usize,
    pub class: usize,
}

impl SignalKey {
    pub fn new(environment: usize, class: usize) -> Self {
        Self { environment, class }
    }
}

/// Post-update values for the keys touched by one step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalUpdate {
    values: BTreeMap<SignalKey, f32>,
}

impl SignalUpdate {
    pub fn get(&self, key: &SignalKey) -> Option<f32> {
        self.values.get(key).copied()
    }

    pub fn is_finite(&self) -> bool {
        self.values.values().all(|v| v.is_finite())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// EMA-smoothed bias-predictability table
#[derive(Debug, Clone, PartialEq)]
pub struct BiasSignal {
    gamma: f32,
    values: BTreeMap<SignalKey, f32>,
}

impl BiasSignal {
    /// Empty table with smoothing factor `gamma` (`bias_ema_gamma`)
    pub fn new(gamma: f32) -> Self {
        Self {
            gamma,
            values: BTreeMap::new(),
        }
    }

    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    pub fn get(&self, key: &SignalKey) -> Option<f32> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (SignalKey, f32)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    /// Rebuild a table from stored entries
    pub fn from_entries(gamma: f32, entries: impl IntoIterator<Item = (SignalKey, f32)>) -> Self {
        Self {
            gamma,
            values: entries.into_iter().collect(),
        }
    }

    /// Compute the EMA update for this step's observations
    ///
    /// An unset key takes the observation as is; otherwise
    /// `gamma * old + (1 - gamma) * observed`.
    pub fn stage(&self, observations: &BTreeMap<SignalKey, f32>) -> SignalUpdate {
        let values = observations
            .iter()
            .map(|(key, &observed)| {
                let value = match self.values.get(key) {
                    None => observed,
                    Some(&old) => self.gamma * old + (1.0 - self.gamma) * observed,
                };
                (*key, value)
            })
            .collect();
        SignalUpdate { values }
    }

    pub fn commit(&mut self, update: SignalUpdate) {
        self.values.extend(update.values);
    }

    /// Stage and commit in one go
    pub fn update(&mut self, observations: &BTreeMap<SignalKey, f32>) {
        let update = self.stage(observations);
        self.commit(update);
    }
}

/// Mean of `losses` per key, keys taken row by row
pub fn observe(keys: &[SignalKey], losses: &[f32]) -> BTreeMap<SignalKey, f32> {
    let mut sums: BTreeMap<SignalKey, (f32, usize)> = BTreeMap::new();
    for (key, loss) in keys.iter().zip(losses) {
        let entry = sums.entry(*key).or_insert((0.0, 0));
        entry.0 += loss;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(key, (sum, n))| (key, sum / n as f32))
        .collect()
}
