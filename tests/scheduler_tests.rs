// tests/scheduler_tests.rs
//
// Worker pool behavior: distribution, ordering, backpressure, failure
// isolation and cancellation.

use std::io;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use io_replay::assign::{AssignmentPolicy, OverflowPolicy};
use io_replay::budget::ErrorBudgetConfig;
use io_replay::cancel::{CancelReason, CancelToken};
use io_replay::executor::{NoopExecutor, OpExecutor, OpOutcome};
use io_replay::record::{OpKind, ReplayRecord};
use io_replay::scheduler::{ReplayScheduler, ReplayTask, RunOutcome, SchedulerConfig};
use io_replay::status::{ErrorKind, TaskError};
use io_replay::trace_reader::TraceItem;
use parking_lot::Mutex;

fn stat_items(n: usize) -> Vec<TraceItem<ReplayRecord>> {
    (0..n)
        .map(|i| TraceItem::Record {
            line: i as u64 + 2,
            record: ReplayRecord::new(OpKind::Stat, format!("/dir{}/file{}", i % 37, i)),
        })
        .collect()
}

fn config(workers: usize) -> SchedulerConfig {
    SchedulerConfig {
        workers,
        honor_timing: false,
        ..Default::default()
    }
}

/// Remembers, per worker, the sequence numbers it executed in order
struct RecordingExecutor {
    seen: Mutex<Vec<Vec<u64>>>,
}

impl RecordingExecutor {
    fn new(workers: usize) -> Self {
        Self {
            seen: Mutex::new(vec![Vec::new(); workers]),
        }
    }

    fn take(&self) -> Vec<Vec<u64>> {
        std::mem::take(&mut *self.seen.lock())
    }
}

impl OpExecutor for RecordingExecutor {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        self.seen.lock()[task.worker].push(task.seq);
        Ok(OpOutcome::default())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Fails every task after a short pause
struct FailingExecutor;

impl OpExecutor for FailingExecutor {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        thread::sleep(Duration::from_millis(1));
        Err(TaskError::execution(
            task.record.kind.as_str(),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        ))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

#[test]
fn test_round_robin_spreads_evenly() {
    let summary = ReplayScheduler::new(config(4))
        .run(stat_items(2000), Arc::new(NoopExecutor), &CancelToken::new())
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.counts.dispatched, 2000);
    assert_eq!(summary.counts.success, 2000);
    assert_eq!(summary.workers.len(), 4);
    for w in &summary.workers {
        assert_eq!(w.executed, 500, "worker {}", w.worker);
        assert!(w.peak_queue_depth <= 512);
    }
}

#[test]
fn test_per_worker_order_is_deterministic() {
    let run = |policy| {
        let exec = Arc::new(RecordingExecutor::new(4));
        let cfg = SchedulerConfig {
            assignment: policy,
            ..config(4)
        };
        ReplayScheduler::new(cfg)
            .run(stat_items(3000), exec.clone(), &CancelToken::new())
            .unwrap();
        exec.take()
    };

    for policy in [AssignmentPolicy::RoundRobin, AssignmentPolicy::TargetHash] {
        let first = run(policy);
        let second = run(policy);
        assert_eq!(first, second, "{} ordering changed between runs", policy);

        // FIFO within each worker
        for seqs in &first {
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(first.iter().map(Vec::len).sum::<usize>(), 3000);
    }
}

#[test]
fn test_small_queue_still_bounded() {
    let cfg = SchedulerConfig {
        queue_capacity: 4,
        ..config(2)
    };
    let summary = ReplayScheduler::new(cfg)
        .run(stat_items(1000), Arc::new(NoopExecutor), &CancelToken::new())
        .unwrap();
    assert_eq!(summary.counts.success, 1000);
    assert!(summary.workers.iter().all(|w| w.peak_queue_depth <= 4));
}

/// Holds the first task long enough for the producer to overrun the queue
struct SlowFirstExecutor;

impl OpExecutor for SlowFirstExecutor {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        if task.seq == 0 {
            thread::sleep(Duration::from_millis(200));
        }
        Ok(OpOutcome::default())
    }

    fn name(&self) -> &'static str {
        "slow-first"
    }
}

#[test]
fn test_reject_policy_records_resource_errors() {
    let cfg = SchedulerConfig {
        queue_capacity: 2,
        overflow: OverflowPolicy::Reject,
        ..config(1)
    };
    let summary = ReplayScheduler::new(cfg)
        .run(stat_items(50), Arc::new(SlowFirstExecutor), &CancelToken::new())
        .unwrap();

    let c = summary.counts;
    assert_eq!(c.dispatched, 50);
    assert_eq!(c.success + c.error, 50);
    assert_eq!(c.unknown, 0);
    assert!(c.error >= 47, "only {} rejected", c.error);
    assert!(summary
        .task_failures
        .iter()
        .all(|f| f.error_kind == ErrorKind::Resource));
    assert_eq!(summary.outcome, RunOutcome::Completed);
}

#[test]
fn test_enqueue_timeout_records_resource_errors() {
    let cfg = SchedulerConfig {
        queue_capacity: 1,
        overflow: OverflowPolicy::Block,
        enqueue_timeout: Some(Duration::from_millis(5)),
        ..config(1)
    };
    let summary = ReplayScheduler::new(cfg)
        .run(stat_items(20), Arc::new(SlowFirstExecutor), &CancelToken::new())
        .unwrap();

    assert_eq!(summary.counts.success + summary.counts.error, 20);
    assert!(summary.counts.error > 0);
    assert!(summary.task_failures[0].message.contains("timed out"));
}

#[test]
fn test_error_budget_cancels_and_leaves_unknown() {
    let cfg = SchedulerConfig {
        error_budget: ErrorBudgetConfig {
            max_total_errors: Some(10),
            ..Default::default()
        },
        ..config(2)
    };
    let summary = ReplayScheduler::new(cfg)
        .run(stat_items(2000), Arc::new(FailingExecutor), &CancelToken::new())
        .unwrap();

    assert!(matches!(
        summary.outcome,
        RunOutcome::Cancelled(CancelReason::ErrorBudgetExceeded(_))
    ));
    let c = summary.counts;
    assert_eq!(c.success, 0);
    assert!(c.error >= 10 && c.error <= 12, "error count {}", c.error);
    assert!(c.unknown > 0);
    assert_eq!(c.dispatched, c.error + c.unknown);
    assert!(summary.discarded > 0);
}

/// Panics on one specific target
struct PanickyExecutor;

impl OpExecutor for PanickyExecutor {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        if task.record.target == "/boom" {
            panic!("boom");
        }
        Ok(OpOutcome::default())
    }

    fn name(&self) -> &'static str {
        "panicky"
    }
}

#[test]
fn test_executor_panic_is_isolated() {
    let mut items = stat_items(20);
    items.insert(
        5,
        TraceItem::Record {
            line: 100,
            record: ReplayRecord::new(OpKind::Stat, "/boom"),
        },
    );

    let summary = ReplayScheduler::new(config(2))
        .run(items, Arc::new(PanickyExecutor), &CancelToken::new())
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.counts.success, 20);
    assert_eq!(summary.counts.error, 1);
    let failure = &summary.task_failures[0];
    assert_eq!(failure.line, 100);
    assert_eq!(failure.error_kind, ErrorKind::Execution);
    assert!(failure.message.contains("boom"));
}

#[test]
fn test_scheduled_delay_is_honored() {
    let items = vec![TraceItem::Record {
        line: 2,
        record: ReplayRecord::new(OpKind::Stat, "/a").with_delay(Duration::from_millis(60)),
    }];
    let cfg = SchedulerConfig {
        honor_timing: true,
        ..config(1)
    };
    let summary = ReplayScheduler::new(cfg)
        .run(items, Arc::new(NoopExecutor), &CancelToken::new())
        .unwrap();
    assert!(summary.wall_time >= Duration::from_millis(60));
    assert_eq!(summary.counts.success, 1);
}

#[test]
fn test_cancel_interrupts_scheduled_wait() {
    let items = vec![TraceItem::Record {
        line: 2,
        record: ReplayRecord::new(OpKind::Stat, "/a").with_delay(Duration::from_secs(30)),
    }];
    let cfg = SchedulerConfig {
        honor_timing: true,
        ..config(1)
    };

    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel(CancelReason::Requested);
        })
    };

    let started = Instant::now();
    let summary = ReplayScheduler::new(cfg)
        .run(items, Arc::new(NoopExecutor), &cancel)
        .unwrap();
    canceller.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.outcome, RunOutcome::Cancelled(CancelReason::Requested));
    assert_eq!(summary.counts.dispatched, 1);
    assert_eq!(summary.counts.unknown, 1);
}

/// Runs `f` on its own thread and fails the test if it does not finish
fn finishes_within<T: Send + 'static>(limit: Duration, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(limit).expect("replay run did not return")
}

#[test]
fn test_worker_dying_outside_executor_does_not_hang_run() {
    // A cancel hook that panics takes down the worker that trips the
    // error budget, outside the executor's panic guard.
    let cancel = CancelToken::new();
    cancel.on_cancel(|| panic!("hook exploded"));

    let cfg = SchedulerConfig {
        queue_capacity: 2,
        error_budget: ErrorBudgetConfig {
            max_total_errors: Some(1),
            ..Default::default()
        },
        ..config(1)
    };
    let summary = finishes_within(Duration::from_secs(10), move || {
        ReplayScheduler::new(cfg)
            .run(stat_items(100), Arc::new(FailingExecutor), &cancel)
            .unwrap()
    });

    assert!(matches!(
        summary.outcome,
        RunOutcome::Cancelled(CancelReason::ErrorBudgetExceeded(_))
    ));
    let c = summary.counts;
    assert_eq!(c.error, 1);
    assert!(c.dispatched < 100);
    assert_eq!(c.dispatched, c.error + c.unknown);
    // Stats of a dead worker are lost, not invented
    assert_eq!(summary.workers[0].executed, 0);
}

#[test]
fn test_out_of_range_start_waits_for_cancel() {
    let mut items = vec![TraceItem::Record {
        line: 2,
        record: ReplayRecord::new(OpKind::Stat, "/far").with_delay(Duration::from_secs(u64::MAX / 2)),
    }];
    items.extend(stat_items(10));
    let cfg = SchedulerConfig {
        queue_capacity: 2,
        honor_timing: true,
        speed: 0.001,
        ..config(1)
    };

    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel(CancelReason::Requested);
        })
    };

    let run_cancel = cancel.clone();
    let summary = finishes_within(Duration::from_secs(10), move || {
        ReplayScheduler::new(cfg)
            .run(items, Arc::new(NoopExecutor), &run_cancel)
            .unwrap()
    });
    canceller.join().unwrap();

    assert_eq!(summary.outcome, RunOutcome::Cancelled(CancelReason::Requested));
    assert_eq!(summary.counts.success, 0);
    assert_eq!(summary.counts.unknown, summary.counts.dispatched);
    assert!(summary.discarded > 0);
}
