//! Fatal-error budget
//!
//! Individual task failures never stop a worker. The budget is the one
//! place where failures add up to a run-level decision: once any
//! configured threshold is crossed the replay is cancelled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_ERROR_RATIO_MIN_SAMPLES;

/// Thresholds; every one is optional and unset means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBudgetConfig {
    /// Cancel once this many tasks have failed
    #[serde(default)]
    pub max_total_errors: Option<u64>,

    /// Cancel once this many tasks in a row have failed
    #[serde(default)]
    pub max_consecutive_errors: Option<u64>,

    /// Cancel once failures exceed this fraction of completed tasks
    #[serde(default)]
    pub max_error_ratio: Option<f64>,

    /// Completed tasks required before the ratio is checked
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
}

fn default_min_samples() -> u64 {
    DEFAULT_ERROR_RATIO_MIN_SAMPLES
}

impl Default for ErrorBudgetConfig {
    fn default() -> Self {
        Self {
            max_total_errors: None,
            max_consecutive_errors: None,
            max_error_ratio: None,
            min_samples: DEFAULT_ERROR_RATIO_MIN_SAMPLES,
        }
    }
}

impl ErrorBudgetConfig {
    pub fn is_unlimited(&self) -> bool {
        self.max_total_errors.is_none()
            && self.max_consecutive_errors.is_none()
            && self.max_error_ratio.is_none()
    }
}

/// Thread-safe failure accounting against an [`ErrorBudgetConfig`].
#[derive(Debug)]
pub struct ErrorBudget {
    config: ErrorBudgetConfig,
    completed: AtomicU64,
    total_errors: AtomicU64,
    consecutive_errors: AtomicU64,
    exhausted: AtomicBool,
}

impl ErrorBudget {
    pub fn new(config: ErrorBudgetConfig) -> Self {
        Self {
            config,
            completed: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(ErrorBudgetConfig::default())
    }

    pub fn config(&self) -> &ErrorBudgetConfig {
        &self.config
    }

    /// Record a successful task (resets the consecutive counter)
    pub fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    /// Record a failed task. Returns `Some(description)` exactly once: on
    /// the failure that first exhausts the budget.
    pub fn record_failure(&self) -> Option<String> {
        let completed = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total_errors.fetch_add(1, Ordering::Relaxed) + 1;
        let consecutive = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;

        let why = self.check(completed, total, consecutive)?;
        if self.exhausted.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(why)
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// (total errors, consecutive errors)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.total_errors.load(Ordering::Relaxed),
            self.consecutive_errors.load(Ordering::Relaxed),
        )
    }

    fn check(&self, completed: u64, total: u64, consecutive: u64) -> Option<String> {
        if let Some(max) = self.config.max_total_errors {
            if total >= max {
                return Some(format!("{} errors (max {})", total, max));
            }
        }
        if let Some(max) = self.config.max_consecutive_errors {
            if consecutive >= max {
                return Some(format!("{} consecutive errors (max {})", consecutive, max));
            }
        }
        if let Some(max_ratio) = self.config.max_error_ratio {
            if completed >= self.config.min_samples.max(1) {
                let ratio = total as f64 / completed as f64;
                if ratio > max_ratio {
                    return Some(format!(
                        "error ratio {:.3} over {} tasks (max {:.3})",
                        ratio, completed, max_ratio
                    ));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_trips() {
        let b = ErrorBudget::unlimited();
        for _ in 0..10_000 {
            assert!(b.record_failure().is_none());
        }
        assert_eq!(b.stats().0, 10_000);
        assert!(!b.is_exhausted());
    }

    #[test]
    fn test_total_threshold_trips_once() {
        let b = ErrorBudget::new(ErrorBudgetConfig {
            max_total_errors: Some(3),
            ..Default::default()
        });
        assert!(b.record_failure().is_none());
        b.record_success();
        assert!(b.record_failure().is_none());
        assert!(b.record_failure().is_some());
        assert!(b.record_failure().is_none());
        assert!(b.is_exhausted());
    }

    #[test]
    fn test_consecutive_reset_by_success() {
        let b = ErrorBudget::new(ErrorBudgetConfig {
            max_consecutive_errors: Some(2),
            ..Default::default()
        });
        assert!(b.record_failure().is_none());
        b.record_success();
        assert!(b.record_failure().is_none());
        assert_eq!(b.stats(), (2, 1));
        assert!(b.record_failure().is_some());
    }

    #[test]
    fn test_ratio_waits_for_samples() {
        let b = ErrorBudget::new(ErrorBudgetConfig {
            max_error_ratio: Some(0.5),
            min_samples: 4,
            ..Default::default()
        });
        assert!(b.record_failure().is_none());
        assert!(b.record_failure().is_none());
        b.record_success();
        // 3/4 > 0.5
        assert!(b.record_failure().is_some());
    }
}
