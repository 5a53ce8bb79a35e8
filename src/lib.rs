// src/lib.rs

pub mod constants;
pub mod status; // StatusCode and the typed error taxonomy

// Trace format
pub mod record;
pub mod tokenizer;
pub mod trace_reader;
pub mod trace_writer;

// Replay engine
pub mod assign;
pub mod budget;
pub mod cancel;
pub mod scheduler;
pub mod task_queue;

// Execution and capture
pub mod capture;
pub mod convert;
pub mod executor;

// Run setup and reporting
pub mod config;
pub mod metrics;
pub mod rlimit;
pub mod stats;
pub mod tsv_export;

pub use metrics::bucket_index;
pub use record::{CaptureRecord, OpKind, ReplayRecord, TraceKind, TraceRecord};
pub use scheduler::{ReplayScheduler, ReplayTask, RunOutcome, RunSummary, SchedulerConfig};
pub use status::StatusCode;
