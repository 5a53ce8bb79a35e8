//! Run-wide status aggregation
//!
//! Workers and the producer report into one shared [`StatusAggregator`].
//! Counters are atomics; latency goes into per-kind histograms; failures
//! are kept with their line numbers, bounded so a pathological trace
//! cannot grow memory without limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::constants::{MAX_REPORTED_LINE_FAILURES, MAX_REPORTED_TASK_FAILURES};
use crate::metrics::KindHists;
use crate::record::OpKind;
use crate::status::{ErrorKind, FormatError};

/// A trace line that could not be turned into a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFailure {
    pub line: u64,
    pub error: FormatError,
}

/// A dispatched task that ended in `ERROR`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub seq: u64,
    pub line: u64,
    pub worker: usize,
    pub kind: OpKind,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub dispatched: u64,
    pub success: u64,
    pub error: u64,
    pub unknown: u64,
    pub parse_errors: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
pub struct StatusAggregator {
    dispatched: AtomicU64,
    success: AtomicU64,
    error: AtomicU64,
    parse_errors: AtomicU64,
    bytes: AtomicU64,
    hists: KindHists,
    line_failures: Mutex<Vec<LineFailure>>,
    task_failures: Mutex<Vec<TaskFailure>>,
}

impl StatusAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A task was created for a record (whether or not it gets queued)
    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self, line: u64, error: FormatError) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        let mut failures = self.line_failures.lock();
        if failures.len() < MAX_REPORTED_LINE_FAILURES {
            failures.push(LineFailure { line, error });
        }
    }

    pub fn record_success(&self, kind: OpKind, bytes: u64, latency: Duration) {
        self.success.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.hists.record(kind, bytes, latency);
    }

    pub fn record_failure(&self, failure: TaskFailure) {
        self.error.fetch_add(1, Ordering::Relaxed);
        let mut failures = self.task_failures.lock();
        if failures.len() < MAX_REPORTED_TASK_FAILURES {
            failures.push(failure);
        }
    }

    /// Tasks dispatched but never completed are `UNKNOWN`
    pub fn counts(&self) -> StatusCounts {
        let dispatched = self.dispatched.load(Ordering::Relaxed);
        let success = self.success.load(Ordering::Relaxed);
        let error = self.error.load(Ordering::Relaxed);
        StatusCounts {
            dispatched,
            success,
            error,
            unknown: dispatched.saturating_sub(success + error),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }

    pub fn hists(&self) -> &KindHists {
        &self.hists
    }

    pub fn line_failures(&self) -> Vec<LineFailure> {
        self.line_failures.lock().clone()
    }

    pub fn task_failures(&self) -> Vec<TaskFailure> {
        self.task_failures.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_is_the_remainder() {
        let agg = StatusAggregator::new();
        for _ in 0..5 {
            agg.record_dispatch();
        }
        agg.record_success(OpKind::Write, 4096, Duration::from_micros(10));
        agg.record_failure(TaskFailure {
            seq: 1,
            line: 3,
            worker: 0,
            kind: OpKind::Read,
            error_kind: ErrorKind::Execution,
            message: "denied".to_string(),
        });

        let c = agg.counts();
        assert_eq!(c.dispatched, 5);
        assert_eq!(c.success, 1);
        assert_eq!(c.error, 1);
        assert_eq!(c.unknown, 3);
        assert_eq!(c.bytes, 4096);
    }

    #[test]
    fn test_failure_lists_are_bounded() {
        let agg = StatusAggregator::new();
        for line in 0..(MAX_REPORTED_LINE_FAILURES as u64 + 50) {
            agg.record_parse_error(line + 2, FormatError::InvalidUtf8);
        }
        assert_eq!(agg.counts().parse_errors, MAX_REPORTED_LINE_FAILURES as u64 + 50);
        let kept = agg.line_failures();
        assert_eq!(kept.len(), MAX_REPORTED_LINE_FAILURES);
        assert_eq!(kept[0].line, 2);
    }
}
