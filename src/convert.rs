//! Capture to replay conversion
//!
//! Timestamps become delays relative to the earliest converted operation
//! and captured thread ids become affinity keys. Capture files are written
//! in completion order, so the earliest start is found in a first pass
//! rather than taken from the first line. Malformed capture lines are
//! skipped and reported, like everywhere else.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::constants::MAX_REPORTED_LINE_FAILURES;
use crate::record::{CaptureRecord, ReplayRecord};
use crate::stats::LineFailure;
use crate::status::StatusCode;
use crate::tokenizer::TraceLimits;
use crate::trace_reader::{TraceFileReader, TraceItem};
use crate::trace_writer::{TraceOutput, TraceWriter};

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    /// Keep operations that failed during capture (dropped by default)
    pub keep_failed: bool,
    pub limits: TraceLimits,
}

#[derive(Debug, Clone, Default)]
pub struct ConversionSummary {
    pub records_read: u64,
    pub records_written: u64,
    pub dropped_failed: u64,
    pub parse_errors: u64,
    /// First failures, with line numbers
    pub line_failures: Vec<LineFailure>,
    /// Span between the first and last converted operation
    pub span: Duration,
}

fn keeps(record: &CaptureRecord, opts: &ConvertOptions) -> bool {
    opts.keep_failed || record.status != StatusCode::Error
}

/// Earliest start time among the records that will be converted.
fn earliest_timestamp(input: &Path, opts: &ConvertOptions) -> Result<Option<Duration>> {
    let reader = TraceFileReader::<CaptureRecord>::open(input, opts.limits)
        .with_context(|| format!("Failed to open capture {}", input.display()))?;
    let mut earliest: Option<Duration> = None;
    for item in reader {
        match item {
            TraceItem::Record { record, .. } if keeps(&record, opts) => {
                earliest = Some(earliest.map_or(record.timestamp, |e| e.min(record.timestamp)));
            }
            TraceItem::Failed(e) => {
                return Err(e).with_context(|| format!("Failed reading {}", input.display()));
            }
            _ => {}
        }
    }
    Ok(earliest)
}

/// Convert `input` (capture) into `output` (replay).
pub fn convert_capture_to_replay(
    input: &Path,
    output: &Path,
    opts: &ConvertOptions,
) -> Result<ConversionSummary> {
    let epoch = earliest_timestamp(input, opts)?.unwrap_or_default();
    debug!("Capture epoch: {:?}", epoch);

    let reader = TraceFileReader::<CaptureRecord>::open(input, opts.limits)
        .with_context(|| format!("Failed to open capture {}", input.display()))?;
    let out = TraceOutput::create(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    let mut writer: TraceWriter<ReplayRecord, TraceOutput> = TraceWriter::new(out, opts.limits)?;
    writer.write_comment(&format!("converted from {}", input.display()))?;

    let mut summary = ConversionSummary::default();

    for item in reader {
        match item {
            TraceItem::Record { line, record } => {
                summary.records_read += 1;
                if !keeps(&record, opts) {
                    summary.dropped_failed += 1;
                    continue;
                }
                let replay = record.to_replay(epoch);
                summary.span = summary.span.max(replay.delay.unwrap_or_default());
                writer
                    .write_record(&replay)
                    .with_context(|| format!("Failed to write record from line {}", line))?;
            }
            TraceItem::Malformed { line, error } => {
                warn!("line {}: {}", line, error);
                summary.parse_errors += 1;
                if summary.line_failures.len() < MAX_REPORTED_LINE_FAILURES {
                    summary.line_failures.push(LineFailure { line, error });
                }
            }
            TraceItem::Failed(e) => {
                return Err(e).with_context(|| format!("Failed reading {}", input.display()));
            }
        }
    }

    summary.records_written = writer.records_written();
    writer
        .into_inner()
        .and_then(TraceOutput::finish)
        .with_context(|| format!("Failed to finalize {}", output.display()))?;

    debug!("Conversion summary: {:?}", summary);
    info!(
        "Converted {} of {} capture records ({} failed dropped, {} malformed lines)",
        summary.records_written, summary.records_read, summary.dropped_failed, summary.parse_errors
    );
    Ok(summary)
}
