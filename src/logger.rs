//! Append-only record sink shared by every worker.
//!
//! Records are written whole while holding the sink's mutex, so lines from
//! concurrent workers never interleave. The guard is dropped at the end of
//! [`SharedLog::record`] whether or not the write succeeded.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::BidsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn marker(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

enum Sink {
    Writer(Box<dyn Write + Send>),
    Console,
}

pub struct SharedLog {
    sink: Mutex<Sink>,
    path: Option<PathBuf>,
}

impl SharedLog {
    /// Records go straight to stdout.
    pub fn console() -> Self {
        Self {
            sink: Mutex::new(Sink::Console),
            path: None,
        }
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(Sink::Writer(writer)),
            path: None,
        }
    }

    /// Opens `<dir>/<prefix>_<timestamp>.log` for appending.
    pub fn create_in(dir: &Path, prefix: &str, timestamp: &str) -> Result<Self, BidsError> {
        fs::create_dir_all(dir)
            .map_err(|err| BidsError::Filesystem(format!("create {}: {err}", dir.display())))?;
        let path = dir.join(format!("{prefix}_{timestamp}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| BidsError::Filesystem(format!("open {}: {err}", path.display())))?;
        Ok(Self {
            sink: Mutex::new(Sink::Writer(Box::new(io::LineWriter::new(file)))),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record(&self, level: LogLevel, message: impl AsRef<str>) {
        let message = message.as_ref();
        mirror(level, message);

        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let result = match &mut *sink {
            Sink::Writer(writer) => write_entry(writer.as_mut(), level, message),
            Sink::Console => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                writeln!(handle, "{message}")
            }
        };
        if let Err(err) = result {
            tracing::warn!("failed to write log record: {err}");
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Info, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Error, message);
    }

    pub fn critical(&self, message: impl AsRef<str>) {
        self.record(LogLevel::Critical, message);
    }
}

impl Default for SharedLog {
    fn default() -> Self {
        Self::console()
    }
}

fn write_entry(writer: &mut dyn Write, level: LogLevel, message: &str) -> io::Result<()> {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
    write!(
        writer,
        "LOG ENTRY {timestamp} - {level} \n{message} \nEND LOG ENTRY\n\n"
    )?;
    writer.flush()
}

fn mirror(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "oxybids::record", "{message}"),
        LogLevel::Info => tracing::info!(target: "oxybids::record", "{message}"),
        LogLevel::Warning => tracing::warn!(target: "oxybids::record", "{message}"),
        LogLevel::Error | LogLevel::Critical => {
            tracing::error!(target: "oxybids::record", severity = level.marker(), "{message}")
        }
    }
}

/// Cloneable in-memory writer, handy for inspecting records.
#[derive(Clone, Default)]
pub struct MemoryWriter {
    buffer: std::sync::Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for SharedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLog").field("path", &self.path).finish()
    }
}
