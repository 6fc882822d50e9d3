//! Training callbacks.
//!
//! Callbacks run on the driver between iterations. They see a snapshot of
//! the model and the full metric histories, may mutate the configuration for
//! subsequent iterations, and can request termination by returning `true`.

use crate::config::BoostConfig;
use crate::model::GbmModel;

/// Per-iteration metric values: one `(name, value)` list per iteration.
pub type MetricHistory = Vec<Vec<(String, f64)>>;

/// A driver-side training callback.
pub trait Callback: Send {
    fn name(&self) -> &'static str;

    /// Called after every iteration. Returning `true` stops training.
    fn on_iteration(
        &mut self,
        config: &mut BoostConfig,
        model: &GbmModel,
        iteration: u32,
        train_history: &MetricHistory,
        test_history: &MetricHistory,
    ) -> bool;
}

// ============================================================================
// EarlyStopping
// ============================================================================

/// Stop when a monitored metric has not improved for `patience` iterations.
///
/// Monitors the test history when present, the train history otherwise.
pub struct EarlyStopping {
    metric: String,
    patience: usize,
    higher_is_better: bool,
    best_value: Option<f64>,
    best_iteration: usize,
    seen: usize,
}

impl EarlyStopping {
    pub fn new(metric: impl Into<String>, patience: usize, higher_is_better: bool) -> Self {
        Self {
            metric: metric.into(),
            patience,
            higher_is_better,
            best_value: None,
            best_iteration: 0,
            seen: 0,
        }
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best_value
    }

    pub fn best_iteration(&self) -> usize {
        self.best_iteration
    }

    fn update(&mut self, value: f64) -> bool {
        let improved = match self.best_value {
            None => true,
            Some(best) => {
                if self.higher_is_better {
                    value > best
                } else {
                    value < best
                }
            }
        };
        if improved {
            self.best_value = Some(value);
            self.best_iteration = self.seen;
        }
        self.seen += 1;
        self.seen - 1 - self.best_iteration >= self.patience
    }
}

impl Callback for EarlyStopping {
    fn name(&self) -> &'static str {
        "early-stopping"
    }

    fn on_iteration(
        &mut self,
        _config: &mut BoostConfig,
        _model: &GbmModel,
        _iteration: u32,
        train_history: &MetricHistory,
        test_history: &MetricHistory,
    ) -> bool {
        let history = if test_history.is_empty() {
            train_history
        } else {
            test_history
        };
        let Some(last) = history.last() else {
            return false;
        };
        let Some(&(_, value)) = last.iter().find(|(name, _)| *name == self.metric) else {
            return false;
        };
        self.update(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_without_improvement() {
        let mut es = EarlyStopping::new("mse", 2, false);
        assert!(!es.update(1.0));
        assert!(!es.update(1.1)); // 1 stale round
        assert!(es.update(1.2)); // 2 stale rounds -> stop
        assert_eq!(es.best_iteration(), 0);
        assert_eq!(es.best_value(), Some(1.0));
    }

    #[test]
    fn improvement_resets_counter() {
        let mut es = EarlyStopping::new("mse", 2, false);
        assert!(!es.update(1.0));
        assert!(!es.update(1.1));
        assert!(!es.update(0.9)); // new best
        assert!(!es.update(1.0));
        assert!(es.update(1.0));
        assert_eq!(es.best_iteration(), 2);
    }

    #[test]
    fn higher_is_better_direction() {
        let mut es = EarlyStopping::new("auc", 1, true);
        assert!(!es.update(0.7));
        assert!(!es.update(0.8));
        assert!(es.update(0.75));
        assert_eq!(es.best_value(), Some(0.8));
    }
}
