//! Bias-aware reweighting of the main loss
//!
//! The signal is a smoothed bias-predictor loss: low means the bias is easy
//! to read from the classifier's features. Predictability
//! `p = exp(-clamp(signal, 0, MAX_SIGNAL))` is normalized by the batch
//! maximum and each example gets weight `1 + gamma * p / max(p)`.

use ndarray::Array1;

/// Signals above this are treated as "not predictable at all"
pub const MAX_SIGNAL: f32 = 50.0;

/// Predictability in `(0, 1]` of a signal value
pub fn predictability(signal: f32) -> f32 {
    (-signal.clamp(0.0, MAX_SIGNAL)).exp()
}

/// Per-example weights for the main loss
///
/// `gamma == 0` yields exactly one for every example.
pub fn example_weights(signals: &[f32], gamma: f32) -> Array1<f32> {
    if gamma == 0.0 {
        return Array1::ones(signals.len());
    }
    let p: Vec<f32> = signals.iter().map(|&s| predictability(s)).collect();
    let max = p.iter().copied().fold(0.0_f32, f32::max);
    if max <= 0.0 {
        return Array1::ones(signals.len());
    }
    Array1::from_iter(p.iter().map(|pi| 1.0 + gamma * pi / max))
}

/// `(1/N) * sum_i weights[i] * losses[i]`
pub fn weighted_mean(losses: &Array1<f32>, weights: &Array1<f32>) -> f32 {
    if losses.is_empty() {
        return 0.0;
    }
    (losses * weights).sum() / losses.len() as f32
}
