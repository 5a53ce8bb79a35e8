//! Capture while replaying
//!
//! [`CapturingExecutor`] wraps another executor and appends one capture
//! record per executed task. The worker index stands in for the thread id,
//! so converting the capture back into a replay trace with the affinity
//! policy reproduces the same per-worker streams.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::executor::{OpExecutor, OpOutcome};
use crate::record::CaptureRecord;
use crate::scheduler::ReplayTask;
use crate::status::{StatusCode, TaskError};
use crate::tokenizer::TraceLimits;
use crate::trace_writer::{TraceOutput, TraceWriter};

pub struct CapturingExecutor<E: OpExecutor> {
    inner: E,
    epoch: Instant,
    writer: Mutex<Option<TraceWriter<CaptureRecord, TraceOutput>>>,
    write_failures: Mutex<u64>,
}

impl<E: OpExecutor> CapturingExecutor<E> {
    /// Wrap `inner`, writing the capture to `path` (`.zst` compresses).
    pub fn create(inner: E, path: &Path, limits: TraceLimits) -> Result<Self> {
        let out = TraceOutput::create(path)
            .with_context(|| format!("Failed to create capture file {}", path.display()))?;
        let writer = TraceWriter::new(out, limits)
            .with_context(|| format!("Failed to write capture header to {}", path.display()))?;
        info!("Capturing executed operations to {}", path.display());
        Ok(Self {
            inner,
            epoch: Instant::now(),
            writer: Mutex::new(Some(writer)),
            write_failures: Mutex::new(0),
        })
    }

    fn append(&self, record: &CaptureRecord) {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return;
        };
        if let Err(e) = writer.write_record(record) {
            let mut failures = self.write_failures.lock();
            if *failures == 0 {
                warn!("Failed to append capture record: {}", e);
            }
            *failures += 1;
        }
    }
}

impl<E: OpExecutor> OpExecutor for CapturingExecutor<E> {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        let started = Instant::now();
        let result = self.inner.execute(task);
        let duration = started.elapsed();

        let rec = &task.record;
        self.append(&CaptureRecord {
            kind: rec.kind,
            target: rec.target.clone(),
            size: rec.size,
            offset: rec.offset,
            timestamp: Duration::from_micros(started.duration_since(self.epoch).as_micros() as u64),
            duration,
            tid: task.worker as u64,
            status: StatusCode::from(&result),
            dest: rec.dest.clone(),
        });

        result
    }

    fn finish(&self) -> Result<()> {
        self.inner.finish()?;

        let failures = *self.write_failures.lock();
        if failures > 0 {
            warn!("{} capture records could not be written", failures);
        }

        let Some(writer) = self.writer.lock().take() else {
            return Ok(());
        };
        let written = writer.records_written();
        writer
            .into_inner()
            .and_then(TraceOutput::finish)
            .context("Failed to finalize capture file")?;
        info!("Captured {} operations", written);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "capturing"
    }
}
