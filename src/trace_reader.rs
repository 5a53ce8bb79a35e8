//! Streaming trace file reader
//!
//! Opens a capture or replay file, validates the version header exactly
//! once, then yields records lazily. Memory use is constant: one line
//! buffer, capped at `max_line_len + 1` bytes, no matter how long the
//! lines in the file actually are.
//!
//! - A bad header (missing, malformed, wrong kind, wrong version) fails
//!   [`TraceFileReader::open`]; no record is ever yielded.
//! - A bad line yields [`TraceItem::Malformed`] and reading continues.
//! - An I/O failure mid-stream yields [`TraceItem::Failed`] once, then the
//!   iterator is done.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::path::Path;

use tracing::{debug, info};

use crate::record::{TraceKind, TraceRecord};
use crate::status::{FormatError, TraceError};
use crate::tokenizer::{TraceLimits, Tokenizer};

/// Parsed `KIND,version` header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    pub kind: TraceKind,
    pub version: u32,
}

/// One step of the record sequence.
#[derive(Debug)]
pub enum TraceItem<R> {
    /// A decoded record and its 1-based source line number
    Record { line: u64, record: R },
    /// A line that failed tokenization or decoding; not fatal
    Malformed { line: u64, error: FormatError },
    /// Reading failed; this is the last item
    Failed(TraceError),
}

/// Open a trace for reading, auto-detecting zstd compression from the
/// `.zst` extension.
pub fn open_trace_input(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    let is_zstd = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s == "zst")
        .unwrap_or(false);

    if is_zstd {
        debug!("Detected zstd compression: {}", path.display());
        Ok(Box::new(BufReader::new(zstd::stream::read::Decoder::new(file)?)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Read only the header of a trace file, whatever its kind.
pub fn probe_header(path: &Path, limits: TraceLimits) -> Result<TraceHeader, TraceError> {
    let mut source = open_trace_input(path)?;
    let mut buf = Vec::new();
    read_header(source.as_mut(), &Tokenizer::new(limits), &mut buf)
}

/// Lazy, forward-only reader of one trace file.
pub struct TraceFileReader<R: TraceRecord> {
    source: Box<dyn BufRead + Send>,
    tokenizer: Tokenizer,
    header: TraceHeader,
    line_no: u64,
    buf: Vec<u8>,
    done: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: TraceRecord> TraceFileReader<R> {
    /// Open `path` and validate its header against `R::KIND`.
    pub fn open(path: &Path, limits: TraceLimits) -> Result<Self, TraceError> {
        info!("Opening {} trace: {}", R::KIND, path.display());
        let source = open_trace_input(path)?;
        Self::from_reader(source, limits)
    }

    /// Wrap any buffered source. The header is consumed and validated here.
    pub fn from_reader<B>(source: B, limits: TraceLimits) -> Result<Self, TraceError>
    where
        B: BufRead + Send + 'static,
    {
        let mut source: Box<dyn BufRead + Send> = Box::new(source);
        let tokenizer = Tokenizer::new(limits);
        let mut buf = Vec::with_capacity(limits.max_line_len + 1);

        let header = read_header(source.as_mut(), &tokenizer, &mut buf)?;
        if header.kind != R::KIND {
            return Err(TraceError::WrongTraceKind {
                expected: R::KIND,
                found: header.kind,
            });
        }
        let supported = R::KIND.supported_version();
        if header.version != supported {
            return Err(TraceError::VersionMismatch {
                kind: header.kind,
                found: header.version,
                supported,
            });
        }
        debug!("Validated {} header, version {}", header.kind, header.version);

        Ok(Self {
            source,
            tokenizer,
            header,
            line_no: 1,
            buf,
            done: false,
            _record: PhantomData,
        })
    }

    pub fn header(&self) -> TraceHeader {
        self.header
    }
}

impl<R: TraceRecord> Iterator for TraceFileReader<R> {
    type Item = TraceItem<R>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let max = self.tokenizer.limits().max_line_len;
            let read = match read_bounded_line(self.source.as_mut(), &mut self.buf, max) {
                Ok(read) => read,
                Err(e) => {
                    self.done = true;
                    return Some(TraceItem::Failed(TraceError::Io(e)));
                }
            };

            let line = match read {
                LineRead::Eof => {
                    self.done = true;
                    return None;
                }
                LineRead::Overlong { len } => {
                    self.line_no += 1;
                    return Some(TraceItem::Malformed {
                        line: self.line_no,
                        error: FormatError::LineTooLong { len, max },
                    });
                }
                LineRead::Line => {
                    self.line_no += 1;
                    self.line_no
                }
            };

            let item = match self.tokenizer.tokenize(&self.buf) {
                Ok(None) => continue,
                Ok(Some(tokens)) => match R::decode(&tokens) {
                    Ok(record) => TraceItem::Record { line, record },
                    Err(error) => TraceItem::Malformed { line, error },
                },
                Err(error) => TraceItem::Malformed { line, error },
            };
            return Some(item);
        }
    }
}

impl<R: TraceRecord> FusedIterator for TraceFileReader<R> {}

// =============================================================================
// Line and header reading
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    Eof,
    /// `buf` holds the line, terminator stripped
    Line,
    /// The line was consumed but not stored; `len` excludes the terminator
    Overlong { len: usize },
}

/// Read one `\n`-terminated line into `buf`, storing at most `max + 1`
/// bytes (the extra byte leaves room for a `\r`). Bytes beyond that are
/// consumed and dropped.
fn read_bounded_line(src: &mut dyn BufRead, buf: &mut Vec<u8>, max: usize) -> io::Result<LineRead> {
    buf.clear();
    let keep = max.saturating_add(1);
    let mut total = 0usize;
    let mut last = None;
    let mut saw_bytes = false;

    loop {
        let available = match src.fill_buf() {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            break;
        }
        saw_bytes = true;

        let newline = available.iter().position(|&b| b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        let room = keep.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        total += chunk.len();
        if let Some(&b) = chunk.last() {
            last = Some(b);
        }

        let consumed = chunk.len() + usize::from(newline.is_some());
        src.consume(consumed);
        if newline.is_some() {
            break;
        }
    }

    if !saw_bytes {
        return Ok(LineRead::Eof);
    }

    let has_cr = last == Some(b'\r');
    let len = total - usize::from(has_cr);
    if len > max {
        buf.clear();
        return Ok(LineRead::Overlong { len });
    }
    if has_cr {
        buf.pop();
    }
    Ok(LineRead::Line)
}

fn read_header(
    src: &mut dyn BufRead,
    tokenizer: &Tokenizer,
    buf: &mut Vec<u8>,
) -> Result<TraceHeader, TraceError> {
    let max = tokenizer.limits().max_line_len;
    match read_bounded_line(src, buf, max)? {
        LineRead::Eof => return Err(TraceError::MissingHeader),
        LineRead::Overlong { len } => {
            return Err(TraceError::InvalidHeader(format!(
                "header line is {} bytes, limit is {}",
                len, max
            )))
        }
        LineRead::Line => {}
    }

    let tokens = tokenizer
        .tokenize(buf)
        .map_err(|e| TraceError::InvalidHeader(e.to_string()))?
        .ok_or_else(|| TraceError::InvalidHeader("first line must be the version header".into()))?;

    let text = tokens.join();
    let (tag, version) = match tokens.as_slice() {
        [tag, version] => (*tag, *version),
        _ => return Err(TraceError::InvalidHeader(text)),
    };
    let kind = TraceKind::from_header_tag(tag)
        .ok_or_else(|| TraceError::InvalidHeader(text.clone()))?;
    let version = version
        .parse::<u32>()
        .map_err(|_| TraceError::InvalidHeader(text.clone()))?;

    Ok(TraceHeader { kind, version })
}
