//! Rolling text log of proxied exchanges
//!
//! One line per exchange, appended under a mutex so concurrent handlers
//! never interleave partial lines. Write failures are reported through
//! `tracing` and otherwise ignored.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

/// Maximum characters of error detail kept per record
pub const MAX_DETAIL_CHARS: usize = 200;

/// Terminal outcome of one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The response was fully relayed with this status
    Status(u16),
    /// The exchange failed; `status` is what the caller saw, if anything
    Error {
        kind: &'static str,
        status: Option<u16>,
        detail: String,
    },
}

/// One proxied exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub outcome: Outcome,
    pub duration_ms: u128,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.method,
            self.path
        )?;
        match &self.outcome {
            Outcome::Status(status) => {
                write!(f, " status={status} duration_ms={}", self.duration_ms)
            }
            Outcome::Error {
                kind,
                status,
                detail,
            } => {
                write!(f, " error={kind}")?;
                if let Some(status) = status {
                    write!(f, " status={status}")?;
                }
                write!(f, " duration_ms={}", self.duration_ms)?;
                if !detail.is_empty() {
                    write!(f, " detail={:?}", truncate_detail(detail))?;
                }
                Ok(())
            }
        }
    }
}

/// Shorten an error message to [`MAX_DETAIL_CHARS`] and flatten newlines
pub fn truncate_detail(detail: &str) -> String {
    let flat: String = detail
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= MAX_DETAIL_CHARS {
        flat
    } else {
        let mut truncated: String = flat.chars().take(MAX_DETAIL_CHARS).collect();
        truncated.push_str("...");
        truncated
    }
}

/// Log write failure
#[derive(Error, Debug)]
#[error("Failed to write exchange log {path}: {source}")]
pub struct LogWriteError {
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

struct LogFile {
    file: Option<File>,
    written: u64,
}

/// Append-only exchange log with size-based rollover
pub struct ExchangeLog {
    path: PathBuf,
    max_bytes: u64,
    inner: Mutex<LogFile>,
}

impl ExchangeLog {
    /// Create a log at `path`; the file is opened lazily on first write
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            inner: Mutex::new(LogFile {
                file: None,
                written: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the previous log generation
    pub fn rolled_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".1");
        PathBuf::from(name)
    }

    /// Append a record, reporting failures through `tracing`
    pub fn record(&self, record: &LogRecord) {
        if let Err(e) = self.try_record(record) {
            tracing::warn!(error = %e, "Exchange log write failed");
        }
    }

    /// Append a record, returning any I/O failure
    pub fn try_record(&self, record: &LogRecord) -> Result<(), LogWriteError> {
        let line = format!("{record}\n");
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_line(&mut inner, line.as_bytes())
            .map_err(|source| LogWriteError {
                path: self.path.clone(),
                source,
            })
    }

    fn write_line(&self, inner: &mut LogFile, line: &[u8]) -> std::io::Result<()> {
        if inner.file.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            inner.written = file.metadata()?.len();
            inner.file = Some(file);
        }

        if self.max_bytes > 0 && inner.written > 0 && inner.written + line.len() as u64 > self.max_bytes
        {
            inner.file = None;
            fs::rename(&self.path, self.rolled_path())?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            inner.written = 0;
            inner.file = Some(file);
        }

        if let Some(file) = inner.file.as_mut() {
            file.write_all(line)?;
            file.flush()?;
            inner.written += line.len() as u64;
        }
        Ok(())
    }
}
