use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the live subscription channel. Slow subscribers that fall
/// further behind than this observe `RecvError::Lagged` and can resync
/// from [`LogSink::snapshot`].
const SUBSCRIBER_CAPACITY: usize = 1024;

/// Severity of a job log entry, ordered `Debug < Info < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Debug,
    Info,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Debug => write!(f, "DEBUG"),
            Severity::Info => write!(f, "INFO"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub severity: Severity,
    pub message: String,
}

impl LogEntry {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

/// Output channel handed to a patch engine.
pub trait PatchLogger: Send + Sync {
    fn debug(&self, msg: &str);
    fn info(&self, msg: &str);
    fn error(&self, msg: &str);
}

/// Append-only, ordered job log shared between the engine (producers) and
/// the presentation layer (consumers).
///
/// Cloning a `LogSink` yields another handle to the same log.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    entries: Mutex<Vec<LogEntry>>,
    verbose: AtomicBool,
    live: broadcast::Sender<LogEntry>,
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new(false)
    }
}

impl fmt::Debug for LogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogSink")
            .field("len", &self.len())
            .field("verbose", &self.is_verbose())
            .finish()
    }
}

impl LogSink {
    pub fn new(verbose: bool) -> Self {
        let (live, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            inner: Arc::new(SinkInner {
                entries: Mutex::new(Vec::new()),
                verbose: AtomicBool::new(verbose),
                live,
            }),
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.inner.verbose.load(Ordering::Relaxed)
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.inner.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Append an entry. Returns `false` when the verbosity gate dropped it.
    ///
    /// The entry is published to live subscribers while the log lock is
    /// held, so subscribers see the same order as snapshots.
    pub fn append(&self, severity: Severity, message: impl Into<String>) -> bool {
        if severity == Severity::Debug && !self.is_verbose() {
            return false;
        }
        let entry = LogEntry::new(severity, message);
        mirror_to_tracing(&entry);

        let mut entries = self.lock();
        entries.push(entry.clone());
        // No subscribers is fine; the entry is still retained.
        let _ = self.inner.live.send(entry);
        true
    }

    /// Copy of the log as it stands right now.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.lock().iter().filter(|e| e.severity == severity).count()
    }

    /// Live feed of entries appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.live.subscribe()
    }

    /// Snapshot plus a live feed starting right after it, with no gap and
    /// no duplicate between the two.
    pub fn snapshot_and_subscribe(&self) -> (Vec<LogEntry>, broadcast::Receiver<LogEntry>) {
        let entries = self.lock();
        let rx = self.inner.live.subscribe();
        (entries.clone(), rx)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        // A producer panicking mid-push cannot leave the Vec inconsistent.
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl PatchLogger for LogSink {
    fn debug(&self, msg: &str) {
        self.append(Severity::Debug, msg);
    }

    fn info(&self, msg: &str) {
        self.append(Severity::Info, msg);
    }

    fn error(&self, msg: &str) {
        self.append(Severity::Error, msg);
    }
}

fn mirror_to_tracing(entry: &LogEntry) {
    match entry.severity {
        Severity::Debug => tracing::debug!(target: "patchctl::engine", "{}", entry.message),
        Severity::Info => tracing::info!(target: "patchctl::engine", "{}", entry.message),
        Severity::Error => tracing::error!(target: "patchctl::engine", "{}", entry.message),
    }
}
