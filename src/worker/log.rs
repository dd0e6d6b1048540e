//! Per-job append-only log with live fan-out to observers.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// One timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEntry {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Destination for job progress lines.
///
/// The runner and the executor it drives both write through this, so a
/// job's log reads as one ordered stream.
pub trait LogSink: Send + Sync {
    fn append(&self, message: String);
}

/// In-memory log sink backing a single job.
///
/// Entries are pushed whole under a short write lock, so readers only ever
/// see complete entries. New entries are also broadcast to subscribers.
pub struct JobLog {
    entries: RwLock<Vec<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
}

impl JobLog {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            entries: RwLock::new(Vec::new()),
            tx,
        }
    }

    /// Append a message, stamped with the current local time.
    pub fn push(&self, message: impl Into<String>) {
        let entry = LogEntry::new(message);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(entry.clone());

        // Sent under the lock so `follow` never misses or repeats an entry.
        // No subscribers is fine.
        let _ = self.tx.send(entry);
    }

    /// Copy of every entry written so far.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages only, without timestamps.
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Follow entries appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    /// History so far plus a receiver for everything after it, with no gap
    /// or overlap between the two.
    pub fn follow(&self) -> (Vec<LogEntry>, broadcast::Receiver<LogEntry>) {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        (entries.clone(), self.tx.subscribe())
    }
}

impl Default for JobLog {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for JobLog {
    fn append(&self, message: String) {
        self.push(message);
    }
}
