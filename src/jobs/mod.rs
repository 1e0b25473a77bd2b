//! Historical ingestion jobs.
//!
//! A job covers {tickers × trading days}; each (ticker, date) pair is one
//! task, the atomic unit of scheduler work. Job and task state live in a
//! single-file SQLite store so pagination survives restarts; the scheduler
//! worker drains runnable tasks one at a time.

pub mod scheduler;
pub mod store;

pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use store::JobStore;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::error::{IngestError, IngestResult};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    /// Paused because the broker rejected the credential; resumes only
    /// after a fresh token is set.
    AuthPaused,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::AuthPaused => "auth_paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> IngestResult<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "auth_paused" => Ok(Self::AuthPaused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(IngestError::malformed(format!("unknown job status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Done,
    Skipped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> IngestResult<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            other => Err(IngestError::malformed(format!(
                "unknown task status: {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }
}

/// Parameters for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tickers: Vec<String>,
    pub date_from: NaiveDate,
    pub date_until: NaiveDate,
    /// Pause between page fetches, rate-limiting the broker endpoint.
    pub delay_ms: u64,
}

/// A historical ingestion job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub tickers: Vec<String>,
    pub date_from: NaiveDate,
    pub date_until: NaiveDate,
    pub delay_ms: u64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_written: u64,
    pub pages_fetched: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// One (ticker, date) unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub job_id: String,
    pub ticker: String,
    pub date: NaiveDate,
    pub status: TaskStatus,
    /// Broker pagination key; absent means "latest page".
    pub next_cursor: Option<String>,
    pub rows_written: u64,
}

/// Aggregate task counts for one job.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub queued: u64,
    pub in_progress: u64,
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.in_progress + self.done + self.skipped + self.failed
    }

    /// True when no task can make further progress.
    pub fn all_terminal(&self) -> bool {
        self.queued == 0 && self.in_progress == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_symmetry() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::AuthPaused,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        for status in [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Skipped,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn test_terminal_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::AuthPaused.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }
}
