//! Runtime diagnostics shared between the bridge and the heartbeat.
//!
//! The bridge records which error queues it discovered and which of them
//! could not be opened. `RecentLogLayer` keeps the latest WARN and ERROR
//! events so the heartbeat can ship them to ServiceControl.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Log entries kept for the heartbeat.
pub const LOG_BUFFER_CAPACITY: usize = 100;

/// A captured log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogEntry {
    pub message: String,
    pub date: DateTime<Utc>,
    pub level: String,
}

impl LogEntry {
    pub fn new(date: DateTime<Utc>, level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            date,
            level: level.into(),
        }
    }
}

#[derive(Default)]
struct State {
    logs: VecDeque<LogEntry>,
    error_queues: BTreeSet<String>,
    not_found: BTreeSet<String>,
}

/// Shared view of what the bridge is doing.
#[derive(Default)]
pub struct DiagnosticsData {
    state: Mutex<State>,
}

impl DiagnosticsData {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a log entry, evicting the oldest past capacity.
    pub fn add_log(&self, date: DateTime<Utc>, level: &str, message: impl Into<String>) {
        let mut state = self.state();
        state.logs.push_back(LogEntry::new(date, level, message));
        while state.logs.len() > LOG_BUFFER_CAPACITY {
            state.logs.pop_front();
        }
    }

    /// Captured entries, oldest first.
    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.state().logs.iter().cloned().collect()
    }

    /// Replace the set of discovered error queues.
    pub fn set_error_queues(&self, queues: BTreeSet<String>) {
        self.state().error_queues = queues;
    }

    pub fn error_queues(&self) -> BTreeSet<String> {
        self.state().error_queues.clone()
    }

    pub fn add_not_found(&self, queue: impl Into<String>) {
        self.state().not_found.insert(queue.into());
    }

    pub fn clear_not_found(&self) {
        self.state().not_found.clear();
    }

    pub fn not_found(&self) -> BTreeSet<String> {
        self.state().not_found.clone()
    }

    /// Discovered queues paired with whether a receiver is consuming them.
    pub fn ingestion_status(&self) -> Vec<(String, bool)> {
        let state = self.state();
        state
            .error_queues
            .iter()
            .map(|queue| (queue.clone(), !state.not_found.contains(queue)))
            .collect()
    }
}

// ============================================================================
// Tracing layer
// ============================================================================

/// Collects the message and the remaining fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
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
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Captures WARN and ERROR events into `DiagnosticsData`.
///
/// Entries read `[<target>]: <message> <field>=<value>...`.
pub struct RecentLogLayer {
    diagnostics: Arc<DiagnosticsData>,
}

impl RecentLogLayer {
    pub fn new(diagnostics: Arc<DiagnosticsData>) -> Self {
        Self { diagnostics }
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "Error",
        Level::WARN => "Warning",
        Level::INFO => "Information",
        Level::DEBUG => "Debug",
        _ => "Trace",
    }
}

impl<S: Subscriber> Layer<S> for RecentLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.message.is_empty() && visitor.fields.is_empty() {
            return;
        }

        let message = format!(
            "[{}]: {}{}",
            metadata.target(),
            visitor.message,
            visitor.fields
        );
        self.diagnostics
            .add_log(Utc::now(), level_name(metadata.level()), message);
    }
}
