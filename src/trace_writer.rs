//! Trace file writer
//!
//! Writes the `KIND,version` header followed by one encoded record per
//! line. Every line goes through the tokenizer the reader uses, so
//! anything written here can be read back.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::marker::PhantomData;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::constants::FIELD_DELIMITER;
use crate::record::TraceRecord;
use crate::status::FormatError;
use crate::tokenizer::{Tokenizer, TraceLimits};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("I/O error while writing trace: {0}")]
    Io(#[from] io::Error),
}

/// File sink for traces; zstd-compressed when the path ends in `.zst`.
pub enum TraceOutput {
    Plain(BufWriter<File>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

impl TraceOutput {
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        let is_zstd = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s == "zst")
            .unwrap_or(false);

        if is_zstd {
            debug!("Writing zstd-compressed trace: {}", path.display());
            Ok(TraceOutput::Zstd(zstd::stream::write::Encoder::new(file, 3)?))
        } else {
            Ok(TraceOutput::Plain(file))
        }
    }

    /// Flush everything; for zstd this also writes the frame epilogue.
    pub fn finish(self) -> io::Result<()> {
        match self {
            TraceOutput::Plain(mut w) => w.flush(),
            TraceOutput::Zstd(enc) => enc.finish()?.flush(),
        }
    }
}

impl Write for TraceOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TraceOutput::Plain(w) => w.write(buf),
            TraceOutput::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TraceOutput::Plain(w) => w.flush(),
            TraceOutput::Zstd(w) => w.flush(),
        }
    }
}

/// Typed writer for one trace kind.
pub struct TraceWriter<R: TraceRecord, W: Write> {
    out: W,
    tokenizer: Tokenizer,
    written: u64,
    _record: PhantomData<fn(&R)>,
}

impl<R: TraceRecord, W: Write> TraceWriter<R, W> {
    /// Write the header and return a writer positioned after it.
    pub fn new(mut out: W, limits: TraceLimits) -> io::Result<Self> {
        writeln!(
            out,
            "{}{}{}",
            R::KIND.header_tag(),
            FIELD_DELIMITER,
            R::KIND.supported_version()
        )?;
        Ok(Self {
            out,
            tokenizer: Tokenizer::new(limits),
            written: 0,
            _record: PhantomData,
        })
    }

    pub fn write_record(&mut self, record: &R) -> Result<(), WriteError> {
        let line = record.encode()?;
        // Same length and arity checks as the reader
        self.tokenizer.tokenize_str(&line)?;
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Write a free-form comment line (`# ...`).
    pub fn write_comment(&mut self, text: &str) -> io::Result<()> {
        for line in text.lines() {
            writeln!(self.out, "# {}", line)?;
        }
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.written
    }

    /// Flush and hand back the sink.
    pub fn into_inner(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}
