//! Proxy decision records and the sinks that receive them.

use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Longest response excerpt kept on a record.
pub const SNIPPET_LIMIT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One routing decision: a skip, an attempt, a failover, a relay, an exhaustion.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyLogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub provider: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_snippet: Option<String>,
}

impl ProxyLogRecord {
    pub fn new(
        level: LogLevel,
        provider: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            provider: provider.into(),
            method: method.into(),
            path: path.into(),
            status: 0,
            message: message.into(),
            error: None,
            response_snippet: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach a lossy UTF-8 excerpt of `body`, at most [`SNIPPET_LIMIT`] chars.
    pub fn with_snippet(mut self, body: &[u8]) -> Self {
        self.response_snippet = excerpt(body);
        self
    }
}

/// Lossy UTF-8 prefix of `body`, at most [`SNIPPET_LIMIT`] chars. `None` when
/// the body is empty.
pub(crate) fn excerpt(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    Some(truncate_chars(&String::from_utf8_lossy(body), SNIPPET_LIMIT))
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub trait ProxyLogSink: Send + Sync {
    fn record(&self, record: ProxyLogRecord);
}

/// Re-emits records as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl ProxyLogSink for TracingLogSink {
    fn record(&self, r: ProxyLogRecord) {
        let error = r.error.as_deref().unwrap_or_default();
        match r.level {
            LogLevel::Debug => debug!(
                provider = %r.provider,
                method = %r.method,
                path = %r.path,
                status = r.status,
                "{}",
                r.message
            ),
            LogLevel::Info => info!(
                provider = %r.provider,
                method = %r.method,
                path = %r.path,
                status = r.status,
                "{}",
                r.message
            ),
            LogLevel::Warn => warn!(
                provider = %r.provider,
                method = %r.method,
                path = %r.path,
                status = r.status,
                error = %error,
                "{}",
                r.message
            ),
            LogLevel::Error => error!(
                provider = %r.provider,
                method = %r.method,
                path = %r.path,
                status = r.status,
                error = %error,
                "{}",
                r.message
            ),
        }
    }
}

/// Appends records to a JSON lines file.
pub struct JsonlLogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLogSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(ProxyError::LogSink)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(ProxyError::LogSink)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProxyLogSink for JsonlLogSink {
    fn record(&self, record: ProxyLogRecord) {
        let Ok(line) = serde_json::to_string(&record) else {
            return;
        };
        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{}", line) {
            warn!(path = %self.path.display(), error = %err, "failed to write proxy log record");
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<ProxyLogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProxyLogRecord> {
        self.records.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.records.lock().iter().map(|r| r.message.clone()).collect()
    }
}

impl ProxyLogSink for MemoryLogSink {
    fn record(&self, record: ProxyLogRecord) {
        self.records.lock().push(record);
    }
}
