//! Edge-triggered operator log.
//!
//! Unlike the `tracing` diagnostics stream, this log tracks *conditions*:
//! an entry is raised once when a condition appears (`new_entry`) and
//! cleared once when it goes away (`entry_gone`). Re-raising an active
//! entry only bumps its repeat count. The control surface dumps the three
//! severity sections with the `log` command, and an external operator
//! indicator can be driven from the active error count.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::core::data::TIMESTAMP_FORMAT;

/// Severity of an operator log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Informational condition.
    Info,
    /// Degraded but operational condition.
    Warning,
    /// Error condition, shown to the operator until cleared.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

/// One tracked condition.
#[derive(Debug, Clone)]
struct LogEntry {
    severity: Severity,
    source: String,
    text: String,
    count: u64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    active: bool,
}

/// Shared, edge-triggered condition log.
///
/// Cheap to clone; all clones share the same entry list.
#[derive(Debug, Clone, Default)]
pub struct LogBook {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogBook {
    /// Create an empty log book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise a condition. A matching active entry has its repeat count
    /// bumped; a matching cleared entry is re-activated.
    pub fn new_entry(&self, severity: Severity, source: &str, text: &str) {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.severity == severity && e.source == source && e.text == text)
        {
            entry.count += 1;
            entry.last_seen = now;
            if !entry.active {
                entry.active = true;
                tracing::info!(source, text, "condition raised again");
            }
            return;
        }
        tracing::info!(%severity, source, text, "condition raised");
        entries.push(LogEntry {
            severity,
            source: source.to_string(),
            text: text.to_string(),
            count: 1,
            first_seen: now,
            last_seen: now,
            active: true,
        });
    }

    /// Clear a condition. Clearing an unknown or already cleared entry is
    /// a no-op, which makes callers free to report "gone" unconditionally.
    pub fn entry_gone(&self, severity: Severity, source: &str, text: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries
            .iter_mut()
            .find(|e| e.severity == severity && e.source == source && e.text == text && e.active)
        {
            entry.active = false;
            entry.last_seen = Utc::now();
            tracing::info!(source, text, "condition cleared");
        }
    }

    /// Whether a condition is currently active.
    pub fn is_active(&self, severity: Severity, source: &str, text: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.severity == severity && e.source == source && e.text == text && e.active)
    }

    /// Number of active entries of the given severity.
    pub fn active_count(&self, severity: Severity) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.severity == severity && e.active)
            .count()
    }

    /// Render all entries of one severity for the `log` command, one per
    /// line, active entries first.
    pub fn dump(&self, severity: Severity) -> String {
        let entries = self.entries.lock().unwrap();
        let mut lines = Vec::new();
        for entry in entries.iter().filter(|e| e.severity == severity) {
            let state = if entry.active { "active" } else { "gone" };
            lines.push(format!(
                "{}: {} {} ({}, count={}, first={}, last={})",
                entry.severity,
                entry.source,
                entry.text,
                state,
                entry.count,
                entry.first_seen.format(TIMESTAMP_FORMAT),
                entry.last_seen.format(TIMESTAMP_FORMAT),
            ));
        }
        lines.sort_by_key(|line| !line.contains("(active,"));
        lines.join("\r\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_clear() {
        let log = LogBook::new();
        assert!(!log.is_active(Severity::Error, "pc id=1", "Not online."));

        log.new_entry(Severity::Error, "pc id=1", "Not online.");
        assert!(log.is_active(Severity::Error, "pc id=1", "Not online."));
        assert_eq!(log.active_count(Severity::Error), 1);

        log.entry_gone(Severity::Error, "pc id=1", "Not online.");
        assert!(!log.is_active(Severity::Error, "pc id=1", "Not online."));
        assert_eq!(log.active_count(Severity::Error), 0);
    }

    #[test]
    fn test_repeat_bumps_count_not_entries() {
        let log = LogBook::new();
        log.new_entry(Severity::Error, "src", "text");
        log.new_entry(Severity::Error, "src", "text");
        log.new_entry(Severity::Error, "src", "text");

        assert_eq!(log.active_count(Severity::Error), 1);
        assert!(log.dump(Severity::Error).contains("count=3"));
    }

    #[test]
    fn test_clearing_unknown_entry_is_noop() {
        let log = LogBook::new();
        log.entry_gone(Severity::Warning, "nobody", "nothing");
        assert_eq!(log.active_count(Severity::Warning), 0);
    }

    #[test]
    fn test_reraise_after_clear() {
        let log = LogBook::new();
        log.new_entry(Severity::Error, "src", "text");
        log.entry_gone(Severity::Error, "src", "text");
        log.new_entry(Severity::Error, "src", "text");

        assert!(log.is_active(Severity::Error, "src", "text"));
        assert_eq!(log.active_count(Severity::Error), 1);
    }

    #[test]
    fn test_dump_separates_severities() {
        let log = LogBook::new();
        log.new_entry(Severity::Info, "a", "info text");
        log.new_entry(Severity::Error, "b", "error text");

        assert!(log.dump(Severity::Info).contains("info text"));
        assert!(!log.dump(Severity::Info).contains("error text"));
        assert!(log.dump(Severity::Error).contains("error text"));
    }
}
