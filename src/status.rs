//! Status codes and the error taxonomy shared by parsing and execution.
//!
//! Every parse and execution step ends in exactly one [`StatusCode`]. The
//! typed errors below carry *why* something became `ERROR`:
//!
//! - [`FormatError`]: one trace line is malformed (recoverable, per line)
//! - [`TraceError`]: the file as a whole is unusable (fatal, whole file)
//! - [`TaskError`]: one replay task failed (recoverable, per task)

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::record::TraceKind;

/// Tri-state outcome of a parse or execution step.
///
/// `Unknown` marks a state that was never reached (e.g. a task discarded
/// by cancellation before it ran). A completed task is never `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusCode {
    Success,
    #[default]
    Unknown,
    Error,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::Error => "ERROR",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusCode {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(StatusCode::Success),
            "UNKNOWN" => Ok(StatusCode::Unknown),
            "ERROR" => Ok(StatusCode::Error),
            _ => Err(FormatError::InvalidField {
                field: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// A completed step is either a success or an error, never `Unknown`.
impl<T, E> From<&Result<T, E>> for StatusCode {
    fn from(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => StatusCode::Success,
            Err(_) => StatusCode::Error,
        }
    }
}

/// Coarse classification of a failure, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A trace line could not be tokenized or decoded
    Format,
    /// The operation failed against the target system
    Execution,
    /// Queue overflow under the reject policy, or an enqueue timeout
    Resource,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Format => "format",
            ErrorKind::Execution => "execution",
            ErrorKind::Resource => "resource",
        })
    }
}

/// A single trace line is malformed. Never fatal to the file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("line is {len} bytes, exceeds the {max} byte limit")]
    LineTooLong { len: usize, max: usize },

    #[error("line has more than {max} tokens")]
    TooManyTokens { max: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown operation kind '{0}'")]
    UnknownOpKind(String),

    #[error("{kind} record is missing required field '{field}'")]
    MissingField { kind: &'static str, field: &'static str },

    #[error("invalid value '{value}' for field '{field}'")]
    InvalidField { field: &'static str, value: String },

    #[error("{kind} record has {count} fields, at most {max} allowed")]
    UnexpectedFields {
        kind: &'static str,
        count: usize,
        max: usize,
    },

    #[error("field '{field}' contains a delimiter or line break")]
    UnencodableField { field: &'static str },
}

/// The trace file cannot be used at all. Reading stops; no record is yielded.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("I/O error while reading trace: {0}")]
    Io(#[from] io::Error),

    #[error("trace file is empty, expected a version header")]
    MissingHeader,

    #[error("malformed version header: {0}")]
    InvalidHeader(String),

    #[error("expected a {expected} trace but the header declares {found}")]
    WrongTraceKind { expected: TraceKind, found: TraceKind },

    #[error("{kind} format version {found} is not supported (supported: {supported})")]
    VersionMismatch {
        kind: TraceKind,
        found: u32,
        supported: u32,
    },
}

/// Why a queue could not accept a task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("queue of worker {worker} is full (capacity {capacity})")]
    QueueFull { worker: usize, capacity: usize },

    #[error("timed out after {waited:?} waiting for space in the queue of worker {worker}")]
    EnqueueTimeout { worker: usize, waited: Duration },

    #[error("worker {worker} has exited")]
    WorkerGone { worker: usize },
}

/// A single replay task failed. Recorded against the task, never fatal.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{op} failed: {source}")]
    Execution {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("executor panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl TaskError {
    pub fn execution(op: &'static str, source: io::Error) -> Self {
        TaskError::Execution { op, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Execution { .. } | TaskError::Panicked(_) => ErrorKind::Execution,
            TaskError::Resource(_) => ErrorKind::Resource,
        }
    }
}
