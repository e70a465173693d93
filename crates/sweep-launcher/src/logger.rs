//! Job Log Module
//!
//! Append-only per-job log files plus an in-memory sink for tests. Header
//! lines are stamped `[timestamp] [LEVEL] [gpu:N] message`.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append-only log of a single job
///
/// Cloning shares the underlying writer, so the stdout and stderr forwarders
/// of one process write into the same log.
#[derive(Clone)]
pub struct JobLog {
    path: PathBuf,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog").field("path", &self.path).finish()
    }
}

impl JobLog {
    pub fn new(path: impl Into<PathBuf>, writer: impl Write + Send + 'static) -> Self {
        Self {
            path: path.into(),
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Log that echoes to stdout (used for single interactive runs)
    pub fn stdout() -> Self {
        Self::new("<stdout>", io::stdout())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes and flush
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(bytes)?;
        writer.flush()
    }

    /// Write a timestamped launcher line
    pub fn header(&self, level: &str, gpu: u32, message: &str) -> io::Result<()> {
        let formatted = format!(
            "[{}] [{}] [gpu:{}] {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            gpu,
            message
        );
        self.append(formatted.as_bytes())
    }
}

/// Where job logs go
pub trait LogSink: Send + Sync {
    /// Open (or reopen) the log at `path` for appending
    fn open(&self, path: &Path) -> Result<JobLog>;
}

/// Log files on disk, opened in append mode and never truncated
#[derive(Debug, Clone, Default)]
pub struct FileLogSink;

impl LogSink for FileLogSink {
    fn open(&self, path: &Path) -> Result<JobLog> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        Ok(JobLog::new(path, file))
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-memory logs keyed by path
///
/// Reopening a path appends to the same buffer, like the file sink.
#[derive(Clone, Default)]
pub struct MemoryLogSink {
    buffers: Arc<Mutex<HashMap<PathBuf, SharedBuffer>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents written to `path` so far
    pub fn contents(&self, path: &Path) -> Option<String> {
        let buffers = lock(&self.buffers);
        buffers
            .get(path)
            .map(|buffer| String::from_utf8_lossy(&lock(&buffer.0)).into_owned())
    }

    /// Every path opened so far, sorted
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = lock(&self.buffers).keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl LogSink for MemoryLogSink {
    fn open(&self, path: &Path) -> Result<JobLog> {
        let buffer = lock(&self.buffers)
            .entry(path.to_path_buf())
            .or_default()
            .clone();
        Ok(JobLog::new(path, buffer))
    }
}
