//! Per-example loss functions
//!
//! Losses return one value per row so callers can reweight examples before
//! reducing. Gradients are with respect to the unreduced per-example loss.

use ndarray::{Array1, Array2, Axis};

/// Row-wise softmax: exp(x_i) / sum(exp(x_j))
pub fn softmax_rows(logits: &Array2<f32>) -> Array2<f32> {
    let mut probs = logits.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Cross entropy per example
///
/// Returns `(losses, probs)`; `probs - onehot(targets)` is the gradient of
/// each example's loss with respect to its logits.
pub fn cross_entropy(logits: &Array2<f32>, targets: &[usize]) -> (Array1<f32>, Array2<f32>) {
    assert_eq!(
        logits.nrows(),
        targets.len(),
        "Logits and targets must have same length"
    );
    let probs = softmax_rows(logits);
    let losses = Array1::from_iter(
        targets
            .iter()
            .enumerate()
            .map(|(i, &t)| -(probs[[i, t]] + 1e-10).ln()),
    );
    (losses, probs)
}

/// Gradient of `sum_i weights[i] * ce_i` with respect to the logits
pub fn cross_entropy_grad(probs: &Array2<f32>, targets: &[usize], weights: &Array1<f32>) -> Array2<f32> {
    let mut grad = probs.clone();
    for (i, &t) in targets.iter().enumerate() {
        grad[[i, t]] -= 1.0;
    }
    grad * &weights.view().insert_axis(Axis(1))
}

/// Mean squared error per example (mean over the output dimensions)
///
/// Returns `(losses, diff)` with `diff = predictions - targets`.
pub fn mse(predictions: &Array2<f32>, targets: &Array2<f32>) -> (Array1<f32>, Array2<f32>) {
    assert_eq!(
        predictions.dim(),
        targets.dim(),
        "Predictions and targets must have same shape"
    );
    let diff = predictions - targets;
    let losses = diff
        .mapv(|d| d * d)
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(predictions.nrows()));
    (losses, diff)
}

/// Gradient of `sum_i weights[i] * mse_i` with respect to the predictions
pub fn mse_grad(diff: &Array2<f32>, weights: &Array1<f32>) -> Array2<f32> {
    let dims = diff.ncols().max(1) as f32;
    diff * (2.0 / dims) * &weights.view().insert_axis(Axis(1))
}

/// Row-wise argmax
pub fn argmax_rows(x: &Array2<f32>) -> Vec<usize> {
    x.axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                    if v > bv {
                        (i, v)
                    } else {
                        (bi, bv)
                    }
                })
                .0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let probs = softmax_rows(&array![[1.0, 2.0, 3.0], [1000.0, 0.0, -1000.0]]);
        for row in probs.axis_iter(Axis(0)) {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn test_cross_entropy_values() {
        let logits = array![[0.0, 0.0], [10.0, -10.0]];
        let (losses, _) = cross_entropy(&logits, &[0, 0]);
        assert_relative_eq!(losses[0], std::f32::consts::LN_2, epsilon = 1e-5);
        assert!(losses[1] < 1e-4);
    }

    #[test]
    fn test_cross_entropy_grad_matches_finite_difference() {
        let logits = array![[0.3_f32, -0.2, 1.1]];
        let (loss, probs) = cross_entropy(&logits, &[2]);
        let grad = cross_entropy_grad(&probs, &[2], &Array1::ones(1));

        let eps = 1e-3;
        let mut bumped = logits.clone();
        bumped[[0, 0]] += eps;
        let (loss_b, _) = cross_entropy(&bumped, &[2]);
        assert_relative_eq!((loss_b[0] - loss[0]) / eps, grad[[0, 0]], epsilon = 1e-2);
    }

    #[test]
    fn test_weighted_grad_scales_rows() {
        let probs = array![[0.5, 0.5], [0.5, 0.5]];
        let grad = cross_entropy_grad(&probs, &[0, 1], &array![1.0, 3.0]);
        assert_relative_eq!(grad[[0, 0]], -0.5);
        assert_relative_eq!(grad[[1, 1]], -1.5);
    }

    #[test]
    fn test_mse_per_example() {
        let (losses, diff) = mse(&array![[1.0, 3.0], [0.0, 0.0]], &array![[0.0, 1.0], [0.0, 0.0]]);
        assert_relative_eq!(losses[0], 2.5);
        assert_relative_eq!(losses[1], 0.0);
        let grad = mse_grad(&diff, &array![1.0, 1.0]);
        assert_relative_eq!(grad[[0, 1]], 2.0);
    }

    #[test]
    #[should_panic(expected = "must have same length")]
    fn test_cross_entropy_mismatched_lengths() {
        cross_entropy(&array![[0.0, 1.0]], &[0, 1]);
    }

    #[test]
    fn test_argmax_rows() {
        assert_eq!(argmax_rows(&array![[0.1, 0.9], [2.0, -1.0]]), vec![1, 0]);
    }
}
