// src/constants.rs
//
// Central location for all constants used throughout io-replay.
// Every tunable here is only a default: the run configuration (config.rs)
// carries the values that are actually used.

use std::time::Duration;

// =============================================================================
// Trace Format
// =============================================================================

/// Version of the supported capture format
pub const CAPTURE_VERSION: u32 = 1;

/// Version of the supported replay format
pub const REPLAY_VERSION: u32 = 1;

/// Max amount of tokens per line in a capture or replay file
/// User can override via config: limits.max_tokens
pub const MAX_TOKENS: usize = 10;

/// Max line length (bytes, terminator excluded) in a capture or replay file
/// User can override via config: limits.max_line_len
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Field delimiter
pub const FIELD_DELIMITER: char = ',';

/// Lines whose first byte is this marker are ignored
pub const COMMENT_MARKER: u8 = b'#';

/// Header tag of a capture file (`CAPTURE,<version>`)
pub const CAPTURE_HEADER_TAG: &str = "CAPTURE";

/// Header tag of a replay file (`REPLAY,<version>`)
pub const REPLAY_HEADER_TAG: &str = "REPLAY";

// =============================================================================
// Replay Scheduling Defaults
// =============================================================================

/// Controls how many tasks can be queued and buffered per worker thread
/// User can override via config: queue_capacity
pub const TASK_BUFFER_PER_THREAD: usize = 512;

/// Replay speed multiplier (2.0 = twice as fast as captured)
pub const DEFAULT_SPEED: f64 = 1.0;

/// Slowest accepted speed multiplier (1000x slower than captured)
pub const MIN_SPEED: f64 = 0.001;

/// How often a worker waiting for a scheduled start re-checks cancellation
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Progress is logged at debug level every N dispatched records
pub const DISPATCH_PROGRESS_INTERVAL: u64 = 10_000;

// =============================================================================
// Error Reporting
// =============================================================================

/// Maximum per-line parse failures kept (with line numbers) for the summary.
/// Every failure is still counted and logged.
pub const MAX_REPORTED_LINE_FAILURES: usize = 100;

/// Maximum per-task failures kept for the summary
pub const MAX_REPORTED_TASK_FAILURES: usize = 100;

/// Minimum completed tasks before an error-ratio budget is evaluated
/// User can override via config: error_budget.min_samples
pub const DEFAULT_ERROR_RATIO_MIN_SAMPLES: u64 = 100;

// =============================================================================
// Process Resource Limits
// =============================================================================

/// Max open files resource user limit
pub const SET_RLIMIT_NOFILE: u64 = 369_216;

/// Max processes resource user limit
pub const SET_RLIMIT_NPROC: u64 = 30_768;

// =============================================================================
// Executor
// =============================================================================

/// Chunk size used when generating WRITE payloads
pub const WRITE_CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB
