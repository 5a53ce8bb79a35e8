//! Capture and replay records
//!
//! Both record types share the tokenizer and differ only in how the fields
//! after the operation kind are interpreted. The field layout is a
//! versioned contract (format version 1):
//!
//! ```text
//! REPLAY,1
//! KIND,target[,size[,offset[,delay_us[,affinity[,dest]]]]]
//!
//! CAPTURE,1
//! KIND,target,size,offset,timestamp_us,duration_ns,tid,status[,dest]
//! ```
//!
//! An empty token in an optional position means "absent".

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    CAPTURE_HEADER_TAG, CAPTURE_VERSION, FIELD_DELIMITER, REPLAY_HEADER_TAG, REPLAY_VERSION,
};
use crate::status::{FormatError, StatusCode};
use crate::tokenizer::TokenSet;

/// Which of the two line formats a file carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Capture,
    Replay,
}

impl TraceKind {
    pub fn header_tag(&self) -> &'static str {
        match self {
            TraceKind::Capture => CAPTURE_HEADER_TAG,
            TraceKind::Replay => REPLAY_HEADER_TAG,
        }
    }

    /// Format version this build reads and writes
    pub fn supported_version(&self) -> u32 {
        match self {
            TraceKind::Capture => CAPTURE_VERSION,
            TraceKind::Replay => REPLAY_VERSION,
        }
    }

    pub fn from_header_tag(tag: &str) -> Option<Self> {
        match tag {
            CAPTURE_HEADER_TAG => Some(TraceKind::Capture),
            REPLAY_HEADER_TAG => Some(TraceKind::Replay),
            _ => None,
        }
    }
}

impl fmt::Display for TraceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraceKind::Capture => "capture",
            TraceKind::Replay => "replay",
        })
    }
}

/// Operation kind, always token 0 of a record line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Create,
    Open,
    Close,
    Read,
    Write,
    Fsync,
    Truncate,
    Stat,
    Unlink,
    Mkdir,
    Rmdir,
    Rename,
}

impl OpKind {
    pub const COUNT: usize = 12;

    pub const ALL: [OpKind; OpKind::COUNT] = [
        OpKind::Create,
        OpKind::Open,
        OpKind::Close,
        OpKind::Read,
        OpKind::Write,
        OpKind::Fsync,
        OpKind::Truncate,
        OpKind::Stat,
        OpKind::Unlink,
        OpKind::Mkdir,
        OpKind::Rmdir,
        OpKind::Rename,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "CREATE",
            OpKind::Open => "OPEN",
            OpKind::Close => "CLOSE",
            OpKind::Read => "READ",
            OpKind::Write => "WRITE",
            OpKind::Fsync => "FSYNC",
            OpKind::Truncate => "TRUNCATE",
            OpKind::Stat => "STAT",
            OpKind::Unlink => "UNLINK",
            OpKind::Mkdir => "MKDIR",
            OpKind::Rmdir => "RMDIR",
            OpKind::Rename => "RENAME",
        }
    }

    /// Position in [`OpKind::ALL`], for per-kind arrays
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// READ, WRITE and TRUNCATE are meaningless without a size
    pub fn requires_size(&self) -> bool {
        matches!(self, OpKind::Read | OpKind::Write | OpKind::Truncate)
    }

    pub fn requires_dest(&self) -> bool {
        matches!(self, OpKind::Rename)
    }

    /// Operations that move payload bytes
    pub fn moves_data(&self) -> bool {
        matches!(self, OpKind::Read | OpKind::Write)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OpKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| FormatError::UnknownOpKind(s.to_string()))
    }
}

/// A record type that can be decoded from, and encoded to, one trace line.
pub trait TraceRecord: Sized + Send + 'static {
    /// The header tag files of this record type carry
    const KIND: TraceKind;

    fn decode(tokens: &TokenSet<'_>) -> Result<Self, FormatError>;

    /// Canonical line (no terminator)
    fn encode(&self) -> Result<String, FormatError>;
}

// =============================================================================
// Replay record
// =============================================================================

/// One operation to re-execute during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayRecord {
    pub kind: OpKind,
    pub target: String,
    pub size: u64,
    pub offset: u64,
    /// Scheduled start relative to replay start
    pub delay: Option<Duration>,
    /// Worker affinity key (usually the captured thread id)
    pub affinity: Option<u64>,
    /// Destination path (RENAME)
    pub dest: Option<String>,
}

impl ReplayRecord {
    pub const MAX_FIELDS: usize = 7;

    pub fn new(kind: OpKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            size: 0,
            offset: 0,
            delay: None,
            affinity: None,
            dest: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_affinity(mut self, key: u64) -> Self {
        self.affinity = Some(key);
        self
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }
}

impl TraceRecord for ReplayRecord {
    const KIND: TraceKind = TraceKind::Replay;

    fn decode(tokens: &TokenSet<'_>) -> Result<Self, FormatError> {
        let kind = decode_kind(tokens)?;
        if tokens.len() > Self::MAX_FIELDS {
            return Err(FormatError::UnexpectedFields {
                kind: kind.as_str(),
                count: tokens.len(),
                max: Self::MAX_FIELDS,
            });
        }

        let target = required(tokens, 1, kind, "target")?.to_string();

        let size = parse_opt_u64(tokens, 2, "size")?;
        if size.is_none() && kind.requires_size() {
            return Err(FormatError::MissingField {
                kind: kind.as_str(),
                field: "size",
            });
        }

        let dest = tokens.optional(6).map(str::to_string);
        if dest.is_none() && kind.requires_dest() {
            return Err(FormatError::MissingField {
                kind: kind.as_str(),
                field: "dest",
            });
        }

        Ok(ReplayRecord {
            kind,
            target,
            size: size.unwrap_or(0),
            offset: parse_opt_u64(tokens, 3, "offset")?.unwrap_or(0),
            delay: parse_opt_u64(tokens, 4, "delay_us")?.map(Duration::from_micros),
            affinity: parse_opt_u64(tokens, 5, "affinity")?,
            dest,
        })
    }

    fn encode(&self) -> Result<String, FormatError> {
        check_encodable("target", &self.target)?;
        if let Some(dest) = &self.dest {
            check_encodable("dest", dest)?;
        }

        let mut fields = vec![
            self.kind.as_str().to_string(),
            self.target.clone(),
            self.size.to_string(),
            self.offset.to_string(),
            self.delay.map(|d| d.as_micros().to_string()).unwrap_or_default(),
            self.affinity.map(|a| a.to_string()).unwrap_or_default(),
            self.dest.clone().unwrap_or_default(),
        ];
        while fields.len() > 4 && fields.last().map_or(false, String::is_empty) {
            fields.pop();
        }
        Ok(join_fields(&fields))
    }
}

// =============================================================================
// Capture record
// =============================================================================

/// One operation observed while capturing a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub kind: OpKind,
    pub target: String,
    pub size: u64,
    pub offset: u64,
    /// Start time relative to the start of the capture
    pub timestamp: Duration,
    /// Observed duration of the operation
    pub duration: Duration,
    /// Capturing thread id
    pub tid: u64,
    /// Outcome observed during capture
    pub status: StatusCode,
    pub dest: Option<String>,
}

impl CaptureRecord {
    pub const MIN_FIELDS: usize = 8;
    pub const MAX_FIELDS: usize = 9;

    const FIELD_NAMES: [&'static str; Self::MIN_FIELDS] = [
        "kind",
        "target",
        "size",
        "offset",
        "timestamp_us",
        "duration_ns",
        "tid",
        "status",
    ];

    /// Turn an observed operation into one to re-execute. `epoch` is the
    /// timestamp of the first captured operation; it becomes replay time 0.
    pub fn to_replay(&self, epoch: Duration) -> ReplayRecord {
        ReplayRecord {
            kind: self.kind,
            target: self.target.clone(),
            size: self.size,
            offset: self.offset,
            delay: Some(self.timestamp.saturating_sub(epoch)),
            affinity: Some(self.tid),
            dest: self.dest.clone(),
        }
    }
}

impl TraceRecord for CaptureRecord {
    const KIND: TraceKind = TraceKind::Capture;

    fn decode(tokens: &TokenSet<'_>) -> Result<Self, FormatError> {
        let kind = decode_kind(tokens)?;
        if tokens.len() > Self::MAX_FIELDS {
            return Err(FormatError::UnexpectedFields {
                kind: kind.as_str(),
                count: tokens.len(),
                max: Self::MAX_FIELDS,
            });
        }
        for (idx, field) in Self::FIELD_NAMES.iter().enumerate().skip(1) {
            required(tokens, idx, kind, field)?;
        }

        let dest = tokens.optional(8).map(str::to_string);
        if dest.is_none() && kind.requires_dest() {
            return Err(FormatError::MissingField {
                kind: kind.as_str(),
                field: "dest",
            });
        }

        Ok(CaptureRecord {
            kind,
            target: required(tokens, 1, kind, "target")?.to_string(),
            size: parse_u64(tokens, 2, "size")?,
            offset: parse_u64(tokens, 3, "offset")?,
            timestamp: Duration::from_micros(parse_u64(tokens, 4, "timestamp_us")?),
            duration: Duration::from_nanos(parse_u64(tokens, 5, "duration_ns")?),
            tid: parse_u64(tokens, 6, "tid")?,
            status: required(tokens, 7, kind, "status")?.parse()?,
            dest,
        })
    }

    fn encode(&self) -> Result<String, FormatError> {
        check_encodable("target", &self.target)?;
        let mut fields = vec![
            self.kind.as_str().to_string(),
            self.target.clone(),
            self.size.to_string(),
            self.offset.to_string(),
            self.timestamp.as_micros().to_string(),
            self.duration.as_nanos().to_string(),
            self.tid.to_string(),
            self.status.as_str().to_string(),
        ];
        if let Some(dest) = &self.dest {
            check_encodable("dest", dest)?;
            fields.push(dest.clone());
        }
        Ok(join_fields(&fields))
    }
}

// =============================================================================
// Field helpers
// =============================================================================

fn decode_kind(tokens: &TokenSet<'_>) -> Result<OpKind, FormatError> {
    tokens.get(0).unwrap_or_default().parse()
}

fn required<'a>(
    tokens: &TokenSet<'a>,
    idx: usize,
    kind: OpKind,
    field: &'static str,
) -> Result<&'a str, FormatError> {
    tokens.optional(idx).ok_or(FormatError::MissingField {
        kind: kind.as_str(),
        field,
    })
}

fn parse_u64(tokens: &TokenSet<'_>, idx: usize, field: &'static str) -> Result<u64, FormatError> {
    let raw = tokens.get(idx).unwrap_or_default();
    raw.parse().map_err(|_| FormatError::InvalidField {
        field,
        value: raw.to_string(),
    })
}

fn parse_opt_u64(
    tokens: &TokenSet<'_>,
    idx: usize,
    field: &'static str,
) -> Result<Option<u64>, FormatError> {
    match tokens.optional(idx) {
        Some(_) => parse_u64(tokens, idx, field).map(Some),
        None => Ok(None),
    }
}

fn check_encodable(field: &'static str, value: &str) -> Result<(), FormatError> {
    if value.is_empty() || value.contains([FIELD_DELIMITER, '\n', '\r']) {
        return Err(FormatError::UnencodableField { field });
    }
    Ok(())
}

fn join_fields(fields: &[String]) -> String {
    let mut delim = [0u8; 4];
    fields.join(FIELD_DELIMITER.encode_utf8(&mut delim))
}
