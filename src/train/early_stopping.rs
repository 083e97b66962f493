//! Patience-based early stopping on test accuracy

/// Stops training when accuracy has not improved for `patience` checks
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    /// Number of checks to wait for improvement
    patience: usize,
    /// Minimum improvement to reset patience
    min_delta: f32,
    best: f32,
    checks_without_improvement: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best: f32::NEG_INFINITY,
            checks_without_improvement: 0,
        }
    }

    /// Continue from a best value recorded before a resume
    pub fn with_best(mut self, best: f32) -> Self {
        self.best = best;
        self
    }

    /// Reset internal state
    pub fn best(&self) -> Option<f32> {
        self.best.is_finite().then_some(self.best)
    }

    /// Record one accuracy; returns true when training should stop
    pub fn should_stop(&mut self, accuracy: f32) -> bool {
        if accuracy > self.best + self.min_delta {
            self.best = accuracy;
            self.checks_without_improvement = 0;
        } else {
            self.checks_without_improvement += 1;
        }
        self.checks_without_improvement >= self.patience
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_patience() {
        let mut es = EarlyStopping::new(2, 0.0);
        assert!(!es.should_stop(0.5));
        assert!(!es.should_stop(0.4));
        assert!(es.should_stop(0.5));
        assert_eq!(es.best(), Some(0.5));
    }

    #[test]
    fn test_improvement_resets() {
        let mut es = EarlyStopping::new(2, 0.01);
        assert!(!es.should_stop(0.5));
        assert!(!es.should_stop(0.505));
        assert!(!es.should_stop(0.6));
        assert!(!es.should_stop(0.59));
        assert_eq!(es.best(), Some(0.6));
    }

    #[test]
    fn test_resumed_best() {
        let mut es = EarlyStopping::new(1, 0.0).with_best(0.9);
        assert!(es.should_stop(0.8));
    }
}
