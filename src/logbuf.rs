//! In-process capped log ring surfaced through the control facade.
//!
//! This is the operator-facing event feed (credential changes, job and
//! session transitions, errors), independent of the `tracing` output. The
//! ring holds the most recent entries; overflow discards the oldest.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Severity of a ring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One operator-visible event.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub job_id: Option<String>,
    pub message: String,
}

/// Fixed-capacity ring of recent events.
pub struct LogRing {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, level: LogLevel, job_id: Option<&str>, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            ts: Utc::now(),
            level,
            job_id: job_id.map(|s| s.to_string()),
            message: message.into(),
        });
    }

    pub fn info(&self, job_id: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Info, job_id, message);
    }

    pub fn warn(&self, job_id: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Warn, job_id, message);
    }

    pub fn error(&self, job_id: Option<&str>, message: impl Into<String>) {
        self.push(LogLevel::Error, job_id, message);
    }

    /// Most recent entries, newest last, at most `limit`.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_discards_oldest() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.info(None, format!("event {}", i));
        }

        let recent = ring.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "event 2");
        assert_eq!(recent[2].message, "event 4");
    }

    #[test]
    fn test_recent_limit() {
        let ring = LogRing::new(10);
        for i in 0..6 {
            ring.info(Some("job-1"), format!("event {}", i));
        }

        let recent = ring.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "event 4");
        assert_eq!(recent[1].message, "event 5");
        assert_eq!(recent[1].job_id.as_deref(), Some("job-1"));
    }
}
