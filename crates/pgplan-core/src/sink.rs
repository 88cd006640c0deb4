//! Log entry sink.
//!
//! Collectors hand every output record to an [`EntrySink`]. The standard sink is
//! the sending half of a bounded `sync_channel`: a full channel blocks the
//! collector until the consumer catches up.

use std::fmt;
use std::sync::mpsc::SyncSender;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl EntryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryLevel::Debug => "debug",
            EntryLevel::Info => "info",
            EntryLevel::Warn => "warn",
            EntryLevel::Error => "error",
        }
    }
}

/// One structured log line produced by a collector.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: EntryLevel,
    /// Operation label, e.g. `explain_plan_output`.
    pub op: &'static str,
    pub line: String,
}

impl LogEntry {
    pub fn info(op: &'static str, line: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level: EntryLevel::Info,
            op,
            line,
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"ts={} op="{}" level="{}" {}"#,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.op,
            self.level.as_str(),
            self.line
        )
    }
}

/// Destination for collector log entries.
pub trait EntrySink: Send {
    /// Delivers an entry, blocking while the destination is full.
    fn emit(&self, entry: LogEntry);
}

impl EntrySink for SyncSender<LogEntry> {
    fn emit(&self, entry: LogEntry) {
        if let Err(e) = self.send(entry) {
            warn!(op = e.0.op, "log sink closed, dropping entry");
        }
    }
}
