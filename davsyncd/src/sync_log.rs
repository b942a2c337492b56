use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

pub const LOG_FILE_NAME: &str = ".davsync.log";
pub const LOG_CAPACITY: usize = 2048;

#[derive(Debug, Error)]
pub enum SyncLogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub level: LogLevel,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub message: String,
}

/// Bounded, append-only record of what the synchronizer did, kept for display.
/// Every entry is also emitted through `tracing`.
pub struct SyncLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for SyncLog {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

impl SyncLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{message}");
        self.push(LogLevel::Debug, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.push(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.push(LogLevel::Error, message);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn save(&self, path: &Path) -> Result<(), SyncLogError> {
        let entries = self.entries();
        let bytes = serde_json::to_vec(&entries)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Replaces the in-memory entries with the ones stored at `path`; a
    /// missing file leaves the log empty.
    pub fn load(&self, path: &Path) -> Result<(), SyncLogError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let loaded: Vec<LogEntry> = serde_json::from_slice(&bytes)?;
        let mut entries = self.lock();
        entries.clear();
        let skip = loaded.len().saturating_sub(self.capacity);
        entries.extend(loaded.into_iter().skip(skip));
        Ok(())
    }

    fn push(&self, level: LogLevel, message: String) {
        let mut entries = self.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            level,
            time: OffsetDateTime::now_utc(),
            message,
        });
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn log_file_path(sync_root: &Path) -> PathBuf {
    sync_root.join(LOG_FILE_NAME)
}
