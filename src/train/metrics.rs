//! Per-epoch training and evaluation metrics

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of one successful training step
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Mean unweighted cross entropy
    pub main_loss: f32,
    /// Bias-weighted loss actually optimized
    pub weighted_loss: f32,
    /// Mean bias predictor loss (absent when the predictor is disabled)
    pub bias_loss: Option<f32>,
    pub main_correct: usize,
    pub bias_correct: Option<usize>,
    pub examples: usize,
}

/// Training metrics of one epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    pub main_loss: f32,
    pub weighted_loss: f32,
    pub bias_loss: Option<f32>,
    pub main_accuracy: f32,
    pub bias_accuracy: Option<f32>,
    pub steps: usize,
    pub skipped_steps: usize,
}

/// Running sums for [`TrainMetrics`]
#[derive(Debug, Clone, Default)]
pub struct TrainAccumulator {
    main_loss: f64,
    weighted_loss: f64,
    bias_loss: f64,
    bias_steps: usize,
    main_correct: usize,
    bias_correct: usize,
    bias_examples: usize,
    examples: usize,
    steps: usize,
    skipped: usize,
}

impl TrainAccumulator {
    pub fn record(&mut self, step: &StepReport) {
        self.main_loss += f64::from(step.main_loss);
        self.weighted_loss += f64::from(step.weighted_loss);
        if let Some(bias_loss) = step.bias_loss {
            self.bias_loss += f64::from(bias_loss);
            self.bias_steps += 1;
        }
        self.main_correct += step.main_correct;
        if let Some(correct) = step.bias_correct {
            self.bias_correct += correct;
            self.bias_examples += step.examples;
        }
        self.examples += step.examples;
        self.steps += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn finish(&self) -> TrainMetrics {
        let per_step = |sum: f64, n: usize| if n == 0 { 0.0 } else { (sum / n as f64) as f32 };
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f32 / den as f32 };
        TrainMetrics {
            main_loss: per_step(self.main_loss, self.steps),
            weighted_loss: per_step(self.weighted_loss, self.steps),
            bias_loss: (self.bias_steps > 0).then(|| per_step(self.bias_loss, self.bias_steps)),
            main_accuracy: ratio(self.main_correct, self.examples),
            bias_accuracy: (self.bias_examples > 0)
                .then(|| ratio(self.bias_correct, self.bias_examples)),
            steps: self.steps,
            skipped_steps: self.skipped,
        }
    }
}

/// Evaluation metrics over one pass of an evaluation loader
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    pub loss: f32,
    pub accuracy: f32,
    /// Accuracy per environment id
    pub group_accuracy: BTreeMap<usize, f32>,
    pub worst_group_accuracy: f32,
    pub mean_group_accuracy: f32,
    pub examples: usize,
}

impl fmt::Display for EvalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss={:.4} acc={:.4} worst_group={:.4} mean_group={:.4}",
            self.loss, self.accuracy, self.worst_group_accuracy, self.mean_group_accuracy
        )
    }
}

/// Running sums for [`EvalMetrics`]
#[derive(Debug, Clone, Default)]
pub struct EvalAccumulator {
    loss: f64,
    correct: usize,
    total: usize,
    groups: BTreeMap<usize, (usize, usize)>,
}

impl EvalAccumulator {
    pub fn record(&mut self, losses: &[f32], predicted: &[usize], labels: &[usize], groups: &[usize]) {
        for (((loss, p), t), g) in losses.iter().zip(predicted).zip(labels).zip(groups) {
            self.loss += f64::from(*loss);
            let hit = usize::from(p == t);
            self.correct += hit;
            self.total += 1;
            let entry = self.groups.entry(*g).or_default();
            entry.0 += hit;
            entry.1 += 1;
        }
    }

    pub fn finish(&self) -> EvalMetrics {
        if self.total == 0 {
            return EvalMetrics::default();
        }
        let group_accuracy: BTreeMap<usize, f32> = self
            .groups
            .iter()
            .map(|(g, (c, n))| (*g, *c as f32 / *n as f32))
            .collect();
        let worst = group_accuracy.values().copied().fold(f32::INFINITY, f32::min);
        let mean = group_accuracy.values().sum::<f32>() / group_accuracy.len() as f32;
        EvalMetrics {
            loss: (self.loss / self.total as f64) as f32,
            accuracy: self.correct as f32 / self.total as f32,
            group_accuracy,
            worst_group_accuracy: worst,
            mean_group_accuracy: mean,
            examples: self.total,
        }
    }
}

/// Metrics of one finished epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// 1-based count of completed epochs
    pub epoch: usize,
    pub train: TrainMetrics,
    pub test: Option<EvalMetrics>,
    pub unbalanced_train: Option<EvalMetrics>,
}

/// Metrics history of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsTracker {
    pub epochs: Vec<EpochRecord>,
    /// Optimizer steps taken across all epochs
    pub steps: usize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_epoch(&mut self, record: EpochRecord) {
        self.steps += record.train.steps;
        self.epochs.push(record);
    }

    /// Best test accuracy observed
    pub fn best_test_accuracy(&self) -> Option<f32> {
        self.epochs
            .iter()
            .filter_map(|r| r.test.as_ref().map(|t| t.accuracy))
            .fold(None, |best, acc| Some(best.map_or(acc, |b: f32| b.max(acc))))
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn step(loss: f32, correct: usize, bias: Option<(f32, usize)>) -> StepReport {
        StepReport {
            main_loss: loss,
            weighted_loss: loss * 1.5,
            bias_loss: bias.map(|b| b.0),
            main_correct: correct,
            bias_correct: bias.map(|b| b.1),
            examples: 4,
        }
    }

    #[test]
    fn test_train_accumulator() {
        let mut acc = TrainAccumulator::default();
        acc.record(&step(1.0, 2, Some((0.5, 4))));
        acc.record(&step(3.0, 4, Some((1.5, 0))));
        acc.record_skip();
        let m = acc.finish();
        assert_relative_eq!(m.main_loss, 2.0);
        assert_relative_eq!(m.weighted_loss, 3.0);
        assert_relative_eq!(m.bias_loss.unwrap(), 1.0);
        assert_relative_eq!(m.main_accuracy, 0.75);
        assert_relative_eq!(m.bias_accuracy.unwrap(), 0.5);
        assert_eq!((m.steps, m.skipped_steps), (2, 1));
    }

    #[test]
    fn test_disabled_predictor_has_no_bias_metrics() {
        let mut acc = TrainAccumulator::default();
        acc.record(&step(1.0, 1, None));
        let m = acc.finish();
        assert_eq!(m.bias_loss, None);
        assert_eq!(m.bias_accuracy, None);
    }

    #[test]
    fn test_group_accuracy() {
        let mut acc = EvalAccumulator::default();
        acc.record(
            &[0.5, 0.5, 0.5, 0.5],
            &[1, 0, 1, 1],
            &[1, 1, 1, 0],
            &[7, 7, 3, 3],
        );
        let m = acc.finish();
        assert_relative_eq!(m.accuracy, 0.5);
        assert_relative_eq!(m.group_accuracy[&7], 0.5);
        assert_relative_eq!(m.group_accuracy[&3], 0.5);
        assert_relative_eq!(m.worst_group_accuracy, 0.5);
        assert_eq!(m.examples, 4);
        assert_eq!(EvalAccumulator::default().finish(), EvalMetrics::default());
    }

    #[test]
    fn test_best_test_accuracy() {
        let mut tracker = MetricsTracker::new();
        assert_eq!(tracker.best_test_accuracy(), None);
        for (epoch, acc) in [(1, 0.4), (2, 0.6), (3, 0.5)] {
            tracker.record_epoch(EpochRecord {
                epoch,
                train: TrainMetrics {
                    steps: 2,
                    ..Default::default()
                },
                test: Some(EvalMetrics {
                    accuracy: acc,
                    ..Default::default()
                }),
                unbalanced_train: None,
            });
        }
        assert_eq!(tracker.best_test_accuracy(), Some(0.6));
        assert_eq!(tracker.steps, 6);
    }
}
