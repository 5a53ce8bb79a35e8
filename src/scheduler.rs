//! Replay scheduler and worker pool
//!
//! One producer (the caller's thread) pulls items from the trace, assigns
//! each record to a worker and pushes it into that worker's bounded
//! queue. N named OS threads each drain their own queue in FIFO order,
//! wait for the record's scheduled start, execute it and report the
//! outcome.
//!
//! Shutdown has two paths:
//! - end of trace: every queue is closed, workers drain what is queued and
//!   exit;
//! - cancellation (Ctrl-C or the error budget): every queue is aborted,
//!   pending tasks are discarded and stay `UNKNOWN`, in-flight operations
//!   finish.
//!
//! Either way `run` joins every worker before it returns. A worker that
//! dies early aborts its own queue on the way out, so the producer never
//! waits on a consumer that is gone.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn};

use crate::assign::{Assigner, AssignmentPolicy, OverflowPolicy};
use crate::budget::{ErrorBudget, ErrorBudgetConfig};
use crate::cancel::{CancelReason, CancelToken};
use crate::constants::{
    CANCEL_POLL_INTERVAL, DEFAULT_SPEED, DISPATCH_PROGRESS_INTERVAL, MIN_SPEED,
    TASK_BUFFER_PER_THREAD,
};
use crate::executor::OpExecutor;
use crate::metrics::KindHists;
use crate::record::ReplayRecord;
use crate::stats::{LineFailure, StatusAggregator, StatusCounts, TaskFailure};
use crate::status::{ErrorKind, ResourceError, TaskError};
use crate::task_queue::{QueueError, TaskQueue};
use crate::trace_reader::TraceItem;

/// A record bound to the worker that will execute it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayTask {
    /// Dispatch order across the whole run, from 0
    pub seq: u64,
    pub worker: usize,
    /// Source line in the trace file
    pub line: u64,
    pub record: ReplayRecord,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub assignment: AssignmentPolicy,
    pub overflow: OverflowPolicy,
    /// Only used with [`OverflowPolicy::Block`]
    pub enqueue_timeout: Option<Duration>,
    /// Timing multiplier; 2.0 replays twice as fast
    pub speed: f64,
    /// Wait for each record's scheduled start; off means as fast as possible
    pub honor_timing: bool,
    pub error_budget: ErrorBudgetConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            queue_capacity: TASK_BUFFER_PER_THREAD,
            assignment: AssignmentPolicy::default(),
            overflow: OverflowPolicy::default(),
            enqueue_timeout: None,
            speed: DEFAULT_SPEED,
            honor_timing: true,
            error_budget: ErrorBudgetConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be at least 1");
        }
        if !(self.speed.is_finite() && self.speed >= MIN_SPEED) {
            bail!("speed must be a number of at least {}, got {}", MIN_SPEED, self.speed);
        }
        if let Some(ratio) = self.error_budget.max_error_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                bail!("max_error_ratio must be within 0.0..=1.0, got {}", ratio);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker: usize,
    pub executed: u64,
    pub success: u64,
    pub error: u64,
    pub peak_queue_depth: usize,
}

/// End-of-run report
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub counts: StatusCounts,
    pub line_failures: Vec<LineFailure>,
    pub task_failures: Vec<TaskFailure>,
    pub workers: Vec<WorkerSummary>,
    pub hists: KindHists,
    pub wall_time: Duration,
    pub outcome: RunOutcome,
    /// Tasks thrown away by cancellation before they ran
    pub discarded: u64,
    /// Set when reading the trace failed mid-stream
    pub trace_error: Option<String>,
    /// Set when the executor failed to shut down cleanly
    pub executor_error: Option<String>,
}

impl RunSummary {
    /// Completed, with no error of any kind
    pub fn is_clean(&self) -> bool {
        self.outcome == RunOutcome::Completed
            && self.counts.error == 0
            && self.counts.unknown == 0
            && self.counts.parse_errors == 0
            && self.trace_error.is_none()
            && self.executor_error.is_none()
    }

    pub fn print(&self) {
        let c = &self.counts;
        let secs = self.wall_time.as_secs_f64();

        println!("\nReplay Summary:");
        match &self.outcome {
            RunOutcome::Completed => println!("  Outcome: completed"),
            RunOutcome::Cancelled(reason) => println!("  Outcome: cancelled ({})", reason),
        }
        println!("  Dispatched: {}", c.dispatched);
        println!("  SUCCESS: {}", c.success);
        println!("  ERROR: {}", c.error);
        println!("  UNKNOWN: {}", c.unknown);
        println!("  Malformed lines: {}", c.parse_errors);
        println!("  Wall time: {:.2}s", secs);
        if secs > 0.0 {
            println!(
                "  Throughput: {:.0} ops/s, {:.2} MiB/s",
                (c.success + c.error) as f64 / secs,
                c.bytes as f64 / 1_048_576.0 / secs
            );
        }

        println!("\nWorkers:");
        for w in &self.workers {
            println!(
                "  [{:>3}] executed={:<8} success={:<8} error={:<8} peak_queue={}",
                w.worker, w.executed, w.success, w.error, w.peak_queue_depth
            );
        }

        self.hists.print_summary();

        if !self.line_failures.is_empty() {
            println!("\nMalformed lines (first {}):", self.line_failures.len());
            for f in &self.line_failures {
                println!("  line {}: {}", f.line, f.error);
            }
        }
        if !self.task_failures.is_empty() {
            println!("\nFailed tasks (first {}):", self.task_failures.len());
            for f in &self.task_failures {
                println!(
                    "  line {} [{} worker {}] {} error: {}",
                    f.line, f.kind, f.worker, f.error_kind, f.message
                );
            }
        }
        if let Some(e) = &self.trace_error {
            println!("\nTrace read failed: {}", e);
        }
        if let Some(e) = &self.executor_error {
            println!("\nExecutor shutdown failed: {}", e);
        }
    }
}

/// State shared by the producer and every worker
struct Shared {
    agg: StatusAggregator,
    budget: ErrorBudget,
    cancel: CancelToken,
    start: Instant,
    speed: f64,
    honor_timing: bool,
    /// Tasks thrown away by an aborted queue
    discarded: AtomicU64,
}

impl Shared {
    fn record_failure(&self, task: &ReplayTask, err: &TaskError) {
        self.agg.record_failure(TaskFailure {
            seq: task.seq,
            line: task.line,
            worker: task.worker,
            kind: task.record.kind,
            error_kind: err.kind(),
            message: err.to_string(),
        });
        if let Some(why) = self.budget.record_failure() {
            self.cancel.cancel(CancelReason::ErrorBudgetExceeded(why));
        }
    }

    fn record_success(&self, task: &ReplayTask, bytes: u64, latency: Duration) {
        self.agg.record_success(task.record.kind, bytes, latency);
        self.budget.record_success();
    }

    /// Scheduled start of a record delayed by `delay`. `None` when it lies
    /// beyond what an `Instant` can represent.
    fn due_at(&self, delay: Duration) -> Option<Instant> {
        let scaled = Duration::try_from_secs_f64(delay.as_secs_f64() / self.speed).ok()?;
        self.start.checked_add(scaled)
    }

    /// Sleep until the task's scheduled start. `false` if cancelled first.
    fn wait_until_due(&self, task: &ReplayTask) -> bool {
        let delay = match task.record.delay {
            Some(d) if self.honor_timing => d,
            _ => return !self.cancel.is_cancelled(),
        };
        let due = self.due_at(delay);
        if due.is_none() {
            warn!(
                "line {}: scheduled start {:?} is out of range, waiting for cancellation",
                task.line, delay
            );
        }
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            let nap = match due {
                Some(due) if now >= due => return true,
                Some(due) => (due - now).min(CANCEL_POLL_INTERVAL),
                None => CANCEL_POLL_INTERVAL,
            };
            thread::sleep(nap);
        }
    }

    fn abort_queue(&self, queue: &TaskQueue<ReplayTask>) -> usize {
        let n = queue.abort();
        self.discarded.fetch_add(n as u64, Ordering::Relaxed);
        n
    }
}

/// Aborts a worker's queue when the worker exits, however it exits.
/// After a normal drain the queue is already empty and closed.
struct QueueReleaser<'a> {
    idx: usize,
    queue: &'a TaskQueue<ReplayTask>,
    shared: &'a Shared,
}

impl Drop for QueueReleaser<'_> {
    fn drop(&mut self) {
        let n = self.shared.abort_queue(self.queue);
        if thread::panicking() {
            error!("Worker {} died, {} queued tasks discarded", self.idx, n);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerStats {
    executed: u64,
    success: u64,
    error: u64,
}

pub struct ReplayScheduler {
    config: SchedulerConfig,
}

impl ReplayScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Replay `items` on a fresh worker pool.
    ///
    /// `items` is usually a [`crate::trace_reader::TraceFileReader`]; its
    /// header has already been validated. Returns an error only when the
    /// pool cannot be set up; everything that goes wrong afterwards is in
    /// the summary.
    pub fn run<I>(
        &self,
        items: I,
        executor: Arc<dyn OpExecutor>,
        cancel: &CancelToken,
    ) -> Result<RunSummary>
    where
        I: IntoIterator<Item = TraceItem<ReplayRecord>>,
    {
        let cfg = &self.config;
        cfg.validate()?;

        info!(
            "Starting replay: {} workers, queue capacity {}, assignment {}, overflow {} ({}), executor {}",
            cfg.workers,
            cfg.queue_capacity,
            cfg.assignment,
            cfg.overflow,
            cfg.overflow.describe(cfg.enqueue_timeout),
            executor.name()
        );
        if cfg.overflow == OverflowPolicy::Reject && cfg.enqueue_timeout.is_some() {
            warn!("enqueue_timeout is ignored with the reject overflow policy");
        }
        if cfg.error_budget.is_unlimited() {
            debug!("No error budget; task failures never cancel the run");
        } else {
            info!("Error budget: {:?}", cfg.error_budget);
        }

        let queues: Vec<Arc<TaskQueue<ReplayTask>>> = (0..cfg.workers)
            .map(|_| Arc::new(TaskQueue::new(cfg.queue_capacity)))
            .collect();

        let shared = Arc::new(Shared {
            agg: StatusAggregator::new(),
            budget: ErrorBudget::new(cfg.error_budget.clone()),
            cancel: cancel.clone(),
            start: Instant::now(),
            speed: cfg.speed,
            honor_timing: cfg.honor_timing,
            discarded: AtomicU64::new(0),
        });

        let handles = spawn_workers(&queues, &shared, &executor)?;

        // Cancellation drops everything still queued. The hook belongs to
        // this run only and is removed before returning.
        let hook = {
            let queues = queues.clone();
            let shared = shared.clone();
            cancel.on_cancel(move || {
                for q in &queues {
                    shared.abort_queue(q);
                }
            })
        };

        let trace_error = dispatch(items, cfg, &queues, &shared);

        for q in &queues {
            q.close();
        }

        let mut workers = Vec::with_capacity(handles.len());
        for (idx, handle) in handles.into_iter().enumerate() {
            let stats = match handle.join() {
                Ok(stats) => stats,
                Err(payload) => {
                    error!("Worker {} panicked: {}", idx, panic_message(payload.as_ref()));
                    WorkerStats::default()
                }
            };
            workers.push(WorkerSummary {
                worker: idx,
                executed: stats.executed,
                success: stats.success,
                error: stats.error,
                peak_queue_depth: queues[idx].peak(),
            });
        }
        cancel.remove_hook(hook);

        let executor_error = executor.finish().err().map(|e| {
            error!("Executor shutdown failed: {:#}", e);
            format!("{:#}", e)
        });

        let wall_time = shared.start.elapsed();
        let outcome = match cancel.reason() {
            Some(reason) => RunOutcome::Cancelled(reason),
            None => RunOutcome::Completed,
        };

        let summary = RunSummary {
            counts: shared.agg.counts(),
            line_failures: shared.agg.line_failures(),
            task_failures: shared.agg.task_failures(),
            workers,
            hists: shared.agg.hists().clone(),
            wall_time,
            outcome,
            discarded: shared.discarded.load(Ordering::Relaxed),
            trace_error,
            executor_error,
        };

        info!(
            "Replay finished in {:.2}s: {} dispatched, {} SUCCESS, {} ERROR, {} UNKNOWN, {} malformed lines",
            wall_time.as_secs_f64(),
            summary.counts.dispatched,
            summary.counts.success,
            summary.counts.error,
            summary.counts.unknown,
            summary.counts.parse_errors
        );
        Ok(summary)
    }
}

fn spawn_workers(
    queues: &[Arc<TaskQueue<ReplayTask>>],
    shared: &Arc<Shared>,
    executor: &Arc<dyn OpExecutor>,
) -> Result<Vec<JoinHandle<WorkerStats>>> {
    let mut handles = Vec::with_capacity(queues.len());
    for (idx, queue) in queues.iter().enumerate() {
        let queue = queue.clone();
        let shared = shared.clone();
        let executor = executor.clone();
        let spawned = thread::Builder::new()
            .name(format!("replay-worker-{}", idx))
            .spawn(move || worker_loop(idx, &queue, &shared, executor.as_ref()));

        match spawned {
            Ok(h) => handles.push(h),
            Err(e) => {
                // Release the workers already running before bailing out
                for q in queues {
                    q.close();
                }
                for h in handles {
                    let _ = h.join();
                }
                return Err(e).with_context(|| format!("Failed to spawn replay worker {}", idx));
            }
        }
    }
    debug!("Spawned {} replay workers", handles.len());
    Ok(handles)
}

/// Producer loop. Returns the trace error that stopped it, if any.
fn dispatch<I>(
    items: I,
    cfg: &SchedulerConfig,
    queues: &[Arc<TaskQueue<ReplayTask>>],
    shared: &Shared,
) -> Option<String>
where
    I: IntoIterator<Item = TraceItem<ReplayRecord>>,
{
    let mut assigner = Assigner::new(cfg.assignment, queues.len());
    let mut seq = 0u64;

    for item in items {
        if shared.cancel.is_cancelled() {
            debug!("Dispatch stopped by cancellation after {} tasks", seq);
            break;
        }

        let (line, record) = match item {
            TraceItem::Record { line, record } => (line, record),
            TraceItem::Malformed { line, error } => {
                warn!("Skipping malformed line {}: {}", line, error);
                shared.agg.record_parse_error(line, error);
                continue;
            }
            TraceItem::Failed(e) => {
                error!("Trace read failed, stopping dispatch: {}", e);
                return Some(e.to_string());
            }
        };

        let worker = assigner.assign(&record);
        let task = ReplayTask {
            seq,
            worker,
            line,
            record,
        };
        seq += 1;
        shared.agg.record_dispatch();

        let queue = &queues[worker];
        let pushed = match (cfg.overflow, cfg.enqueue_timeout) {
            (OverflowPolicy::Block, None) => queue.enqueue(task),
            (OverflowPolicy::Block, Some(t)) => queue.enqueue_timeout(task, t),
            (OverflowPolicy::Reject, _) => queue.try_enqueue(task),
        };

        match pushed {
            Ok(()) => {}
            Err(QueueError::Closed(task)) => {
                if shared.cancel.is_cancelled() {
                    debug!("Queue {} closed during dispatch", worker);
                    break;
                }
                // The worker died; its tasks fail, the others carry on
                let err = TaskError::from(ResourceError::WorkerGone { worker });
                debug!("line {}: {}", task.line, err);
                shared.record_failure(&task, &err);
            }
            Err(QueueError::Full(task)) => {
                let err = TaskError::from(ResourceError::QueueFull {
                    worker,
                    capacity: queue.capacity(),
                });
                debug!("line {}: {}", task.line, err);
                shared.record_failure(&task, &err);
            }
            Err(QueueError::TimedOut(task)) => {
                let err = TaskError::from(ResourceError::EnqueueTimeout {
                    worker,
                    waited: cfg.enqueue_timeout.unwrap_or_default(),
                });
                debug!("line {}: {}", task.line, err);
                shared.record_failure(&task, &err);
            }
        }

        if seq % DISPATCH_PROGRESS_INTERVAL == 0 {
            debug!("Dispatched {} tasks", seq);
        }
    }
    None
}

fn worker_loop(
    idx: usize,
    queue: &TaskQueue<ReplayTask>,
    shared: &Shared,
    executor: &dyn OpExecutor,
) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let _releaser = QueueReleaser { idx, queue, shared };
    debug!("Worker {} started", idx);

    while let Some(task) = queue.dequeue() {
        if !shared.wait_until_due(&task) {
            break;
        }

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&task)))
            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));
        let latency = started.elapsed();
        stats.executed += 1;

        match result {
            Ok(outcome) => {
                stats.success += 1;
                shared.record_success(&task, outcome.bytes, latency);
            }
            Err(e) => {
                stats.error += 1;
                if e.kind() == ErrorKind::Execution {
                    debug!("line {}: {} {} failed: {}", task.line, task.record.kind, task.record.target, e);
                }
                shared.record_failure(&task, &e);
            }
        }
    }

    debug!(
        "Worker {} exiting: {} executed, {} errors",
        idx, stats.executed, stats.error
    );
    stats
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::NoopExecutor;
    use crate::record::OpKind;

    fn items(n: usize) -> Vec<TraceItem<ReplayRecord>> {
        (0..n)
            .map(|i| TraceItem::Record {
                line: i as u64 + 2,
                record: ReplayRecord::new(OpKind::Stat, format!("/f{}", i)),
            })
            .collect()
    }

    fn config(workers: usize) -> SchedulerConfig {
        SchedulerConfig {
            workers,
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(config(1).validate().is_ok());
        assert!(config(0).validate().is_err());
        let mut c = config(1);
        c.speed = 0.0;
        assert!(c.validate().is_err());
        c.speed = 1e-13;
        assert!(c.validate().is_err());
        c.speed = MIN_SPEED;
        assert!(c.validate().is_ok());
        c.speed = 1.0;
        c.queue_capacity = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_all_tasks_complete() {
        let sched = ReplayScheduler::new(config(3));
        let summary = sched
            .run(items(100), Arc::new(NoopExecutor), &CancelToken::new())
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.counts.dispatched, 100);
        assert_eq!(summary.counts.success, 100);
        assert_eq!(summary.counts.unknown, 0);
        assert_eq!(summary.workers.iter().map(|w| w.executed).sum::<u64>(), 100);
        assert!(summary.is_clean());
    }

    #[test]
    fn test_malformed_lines_are_counted_not_dispatched() {
        let mut input = items(3);
        input.insert(
            1,
            TraceItem::Malformed {
                line: 99,
                error: crate::status::FormatError::InvalidUtf8,
            },
        );
        let summary = ReplayScheduler::new(config(2))
            .run(input, Arc::new(NoopExecutor), &CancelToken::new())
            .unwrap();
        assert_eq!(summary.counts.dispatched, 3);
        assert_eq!(summary.counts.parse_errors, 1);
        assert_eq!(summary.line_failures[0].line, 99);
    }

    #[test]
    fn test_pre_cancelled_run_dispatches_nothing() {
        let cancel = CancelToken::new();
        cancel.cancel(CancelReason::Requested);
        let summary = ReplayScheduler::new(config(2))
            .run(items(10), Arc::new(NoopExecutor), &cancel)
            .unwrap();
        assert_eq!(summary.counts.dispatched, 0);
        assert_eq!(summary.outcome, RunOutcome::Cancelled(CancelReason::Requested));
    }

    fn shared(speed: f64) -> Shared {
        Shared {
            agg: StatusAggregator::new(),
            budget: ErrorBudget::unlimited(),
            cancel: CancelToken::new(),
            start: Instant::now(),
            speed,
            honor_timing: true,
            discarded: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_due_at_saturates() {
        let s = shared(2.0);
        assert_eq!(s.due_at(Duration::from_secs(1)), Some(s.start + Duration::from_millis(500)));
        assert_eq!(s.due_at(Duration::MAX), None);

        let slow = shared(1e-13);
        assert_eq!(slow.due_at(Duration::from_secs(10_000_000)), None);
    }

    #[test]
    fn test_run_leaves_no_hook_behind() {
        let cancel = CancelToken::new();
        for _ in 0..3 {
            let summary = ReplayScheduler::new(config(2))
                .run(items(20), Arc::new(NoopExecutor), &cancel)
                .unwrap();
            assert_eq!(summary.counts.success, 20);
            assert_eq!(cancel.pending_hooks(), 0);
        }
    }

    #[test]
    fn test_panic_message() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
    }
}
