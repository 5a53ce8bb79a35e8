//! Operation executors
//!
//! The scheduler only knows the [`OpExecutor`] trait. This module ships
//! the two concrete executors the binary needs: [`FsExecutor`], which
//! replays against a directory tree, and [`NoopExecutor`] for dry runs.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::constants::WRITE_CHUNK_SIZE;
use crate::record::OpKind;
use crate::scheduler::ReplayTask;
use crate::status::TaskError;

/// What a successful operation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpOutcome {
    /// Payload bytes moved (READ and WRITE only)
    pub bytes: u64,
}

impl OpOutcome {
    pub fn bytes(bytes: u64) -> Self {
        Self { bytes }
    }
}

/// Performs the I/O for one replay task.
///
/// Called concurrently from every worker thread. An implementation must
/// never let one task's failure affect another's; errors are returned, and
/// panics are caught by the worker.
pub trait OpExecutor: Send + Sync {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError>;

    /// Called once after every worker has exited
    fn finish(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

impl<E: OpExecutor + ?Sized> OpExecutor for Arc<E> {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        (**self).execute(task)
    }

    fn finish(&self) -> anyhow::Result<()> {
        (**self).finish()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

// =============================================================================
// Dry run
// =============================================================================

/// Succeeds without touching any storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExecutor;

impl OpExecutor for NoopExecutor {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        let rec = &task.record;
        trace!("dry-run {} {}", rec.kind, rec.target);
        let bytes = if rec.kind.moves_data() { rec.size } else { 0 };
        Ok(OpOutcome::bytes(bytes))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

// =============================================================================
// Filesystem
// =============================================================================

/// Replays operations under a root directory.
///
/// Trace paths are taken relative to the root (a leading `/` is dropped);
/// paths that climb out of it with `..` are refused. OPEN caches a handle
/// that READ, WRITE and FSYNC on the same path reuse until CLOSE.
pub struct FsExecutor {
    root: PathBuf,
    create_parents: bool,
    handles: Mutex<HashMap<PathBuf, Arc<File>>>,
    fill: Vec<u8>,
}

/// Pattern period; prime so it never lines up with block sizes
const FILL_PERIOD: usize = 251;

impl FsExecutor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        // One chunk plus one period, so any phase can be sliced out
        let fill = (0..WRITE_CHUNK_SIZE + FILL_PERIOD)
            .map(|i| (i % FILL_PERIOD) as u8)
            .collect();
        Self {
            root: root.into(),
            create_parents: true,
            handles: Mutex::new(HashMap::new()),
            fill,
        }
    }

    /// Create missing parent directories on CREATE, WRITE and MKDIR
    /// (default: on)
    pub fn with_create_parents(mut self, enabled: bool) -> Self {
        self.create_parents = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of handles currently held open by OPEN
    pub fn open_handles(&self) -> usize {
        self.handles.lock().len()
    }

    /// Map a trace path to a path under the root
    pub fn resolve(&self, target: &str) -> io::Result<PathBuf> {
        let rel = Path::new(target.trim_start_matches('/'));
        let mut out = self.root.clone();
        for comp in rel.components() {
            match comp {
                Component::Normal(c) => out.push(c),
                Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("path '{}' escapes the target root", target),
                    ))
                }
            }
        }
        Ok(out)
    }

    fn ensure_parent(&self, path: &Path) -> io::Result<()> {
        if !self.create_parents {
            return Ok(());
        }
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    fn cached(&self, path: &Path) -> Option<Arc<File>> {
        self.handles.lock().get(path).cloned()
    }

    /// Cached handle, or a fresh one opened with `opts`
    fn handle(&self, path: &Path, opts: &OpenOptions) -> io::Result<Arc<File>> {
        match self.cached(path) {
            Some(f) => Ok(f),
            None => Ok(Arc::new(opts.open(path)?)),
        }
    }

    fn do_open(&self, path: PathBuf) -> io::Result<u64> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .or_else(|_| File::open(&path))?;
        self.handles.lock().insert(path, Arc::new(file));
        Ok(0)
    }

    fn do_read(&self, path: &Path, size: u64, offset: u64) -> io::Result<u64> {
        let file = self.handle(path, OpenOptions::new().read(true))?;
        let mut buf = vec![0u8; (size as usize).min(WRITE_CHUNK_SIZE)];
        let mut done = 0u64;
        while done < size {
            let want = ((size - done) as usize).min(buf.len());
            let n = read_at(&file, &mut buf[..want], offset + done)?;
            if n == 0 {
                break;
            }
            done += n as u64;
        }
        Ok(done)
    }

    fn do_write(&self, path: &Path, size: u64, offset: u64) -> io::Result<u64> {
        let file = match self.cached(path) {
            Some(f) => f,
            None => {
                self.ensure_parent(path)?;
                Arc::new(OpenOptions::new().write(true).create(true).open(path)?)
            }
        };
        let mut done = 0u64;
        while done < size {
            let pos = offset + done;
            let phase = (pos % FILL_PERIOD as u64) as usize;
            let len = ((size - done) as usize).min(WRITE_CHUNK_SIZE);
            write_all_at(&file, &self.fill[phase..phase + len], pos)?;
            done += len as u64;
        }
        Ok(done)
    }

    fn do_rename(&self, from: PathBuf, to: PathBuf) -> io::Result<u64> {
        self.ensure_parent(&to)?;
        fs::rename(&from, &to)?;
        let mut handles = self.handles.lock();
        if let Some(f) = handles.remove(&from) {
            handles.insert(to, f);
        }
        Ok(0)
    }

    fn run(&self, task: &ReplayTask) -> io::Result<u64> {
        let rec = &task.record;
        let path = self.resolve(&rec.target)?;

        match rec.kind {
            OpKind::Create => {
                self.ensure_parent(&path)?;
                File::create(&path)?;
                Ok(0)
            }
            OpKind::Open => self.do_open(path),
            OpKind::Close => {
                self.handles.lock().remove(&path);
                Ok(0)
            }
            OpKind::Read => self.do_read(&path, rec.size, rec.offset),
            OpKind::Write => self.do_write(&path, rec.size, rec.offset),
            OpKind::Fsync => {
                let file = self.handle(&path, OpenOptions::new().write(true))?;
                file.sync_all()?;
                Ok(0)
            }
            OpKind::Truncate => {
                let file = self.handle(&path, OpenOptions::new().write(true))?;
                file.set_len(rec.size)?;
                Ok(0)
            }
            OpKind::Stat => {
                fs::metadata(&path)?;
                Ok(0)
            }
            OpKind::Unlink => {
                self.handles.lock().remove(&path);
                fs::remove_file(&path)?;
                Ok(0)
            }
            OpKind::Mkdir => {
                if self.create_parents {
                    fs::create_dir_all(&path)?;
                } else {
                    fs::create_dir(&path)?;
                }
                Ok(0)
            }
            OpKind::Rmdir => {
                fs::remove_dir(&path)?;
                Ok(0)
            }
            OpKind::Rename => {
                let dest = rec.dest.as_deref().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "RENAME without destination")
                })?;
                let to = self.resolve(dest)?;
                self.do_rename(path, to)
            }
        }
    }
}

impl OpExecutor for FsExecutor {
    fn execute(&self, task: &ReplayTask) -> Result<OpOutcome, TaskError> {
        self.run(task)
            .map(OpOutcome::bytes)
            .map_err(|e| TaskError::execution(task.record.kind.as_str(), e))
    }

    fn finish(&self) -> anyhow::Result<()> {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            debug!("Closing {} handles left open by the trace", handles.len());
        }
        handles.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
