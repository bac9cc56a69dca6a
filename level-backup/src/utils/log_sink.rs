//! Per-backup log capture.
//!
//! Every tracing event is recorded into the current [`LogSink`]. When a backup
//! starts archiving, the orchestrator swaps in a fresh sink and, once the
//! archive is written, flushes the old one next to it as
//! `logs_{dataset}_{timestamp}/{source}.txt`.
//!
//! A sink holds at most a fixed number of entries and drops the oldest beyond
//! that, so a daemon that rarely backs up does not grow without bound.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Write as _};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

const CRATE_TARGET_PREFIX: &str = "level_backup::";

/// Entries kept per sink unless configured otherwise
pub const DEFAULT_CAPACITY: usize = 10_000;

/// One captured log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    /// Module the event came from, used as the log file name
    pub source: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: Level, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>5} {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level,
            self.message
        )
    }
}

/// Log entries accumulated during one backup cycle
#[derive(Debug)]
pub struct LogSink {
    entries: Mutex<Ring>,
}

#[derive(Debug)]
struct Ring {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    dropped: u64,
}

impl LogSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Ring {
                entries: VecDeque::new(),
                capacity,
                dropped: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).capacity
    }

    /// Append `entry`, evicting the oldest entry when full
    pub fn record(&self, entry: LogEntry) {
        let mut ring = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.capacity == 0 {
            ring.dropped += 1;
            return;
        }
        if ring.entries.len() == ring.capacity {
            ring.entries.pop_front();
            ring.dropped += 1;
        }
        ring.entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        let ring = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        ring.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    /// Entries evicted because the sink was full
    pub fn dropped(&self) -> u64 {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).dropped
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write one `{source}.txt` per source into `dir`, creating it.
    ///
    /// An existing file is never overwritten; `_2`, `_3`, ... are appended
    /// to the name instead. Returns the files written.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut by_source: BTreeMap<String, Vec<LogEntry>> = BTreeMap::new();
        for entry in self.entries() {
            by_source.entry(sanitize(&entry.source)).or_default().push(entry);
        }

        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(by_source.len());
        for (source, entries) in by_source {
            let path = unique_path(dir, &source);
            let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
            for entry in entries {
                writeln!(file, "{entry}")?;
            }
            file.flush()?;
            written.push(path);
        }
        Ok(written)
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

fn sanitize(source: &str) -> String {
    let cleaned: String = source
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "log".to_string()
    } else {
        cleaned
    }
}

fn unique_path(dir: &Path, stem: &str) -> PathBuf {
    let mut path = dir.join(format!("{stem}.txt"));
    let mut suffix = 2;
    while path.exists() {
        path = dir.join(format!("{stem}_{suffix}.txt"));
        suffix += 1;
    }
    path
}

/// Handle to the current sink, shared by the tracing layer and the orchestrator
#[derive(Debug, Clone, Default)]
pub struct BackupLog {
    current: Arc<Mutex<Arc<LogSink>>>,
}

impl BackupLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sinks of this log keep at most `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            current: Arc::new(Mutex::new(Arc::new(LogSink::with_capacity(capacity)))),
        }
    }

    pub fn current(&self) -> Arc<LogSink> {
        Arc::clone(&self.current.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install a fresh sink and return the previous one
    pub fn swap(&self) -> Arc<LogSink> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = Arc::new(LogSink::with_capacity(current.capacity()));
        std::mem::replace(&mut *current, fresh)
    }

    pub fn record(&self, entry: LogEntry) {
        self.current().record(entry);
    }

    /// A tracing layer feeding this log
    pub fn layer(&self) -> BackupLogLayer {
        BackupLogLayer { log: self.clone() }
    }
}

/// Records tracing events into a [`BackupLog`]
pub struct BackupLogLayer {
    log: BackupLog,
}

impl<S: Subscriber> Layer<S> for BackupLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.log.record(LogEntry::new(
            *metadata.level(),
            source_of(metadata.target()),
            visitor.finish(),
        ));
    }
}

/// `level_backup::retention` -> `retention`, `tokio::runtime` -> `tokio`
fn source_of(target: &str) -> &str {
    let trimmed = target.strip_prefix(CRATE_TARGET_PREFIX).unwrap_or(target);
    trimmed.split("::").next().unwrap_or(trimmed)
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
