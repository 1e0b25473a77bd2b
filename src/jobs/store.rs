//! Durable persistence for jobs, tasks, and job logs.
//!
//! Single-file SQLite store. The correctness-critical contract: a task's
//! pagination cursor is persisted in the same transaction as the rows and
//! page counters it accounts for, so a crash or pause never loses or
//! repeats progress. Any `in_progress` task found at open time is a relic
//! of an unclean shutdown and is reclaimed to `queued`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};
use crate::logbuf::{LogEntry, LogLevel};

use super::{Job, JobStatus, NewJob, Task, TaskCounts, TaskStatus};

/// Append-only job log retention.
const JOB_LOG_CAP: i64 = 5000;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    tickers TEXT NOT NULL,
    date_from TEXT NOT NULL,
    date_until TEXT NOT NULL,
    delay_ms INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    rows_written INTEGER NOT NULL DEFAULT 0,
    pages_fetched INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    job_id TEXT NOT NULL REFERENCES jobs(id),
    ticker TEXT NOT NULL,
    date TEXT NOT NULL,
    status TEXT NOT NULL,
    next_cursor TEXT,
    rows_written INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, ticker, date)
);

-- "pick next runnable task" scans by status first.
CREATE INDEX IF NOT EXISTS idx_tasks_status_job ON tasks(status, job_id);

CREATE TABLE IF NOT EXISTS job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    level TEXT NOT NULL,
    job_id TEXT,
    message TEXT NOT NULL
);
"#;

impl From<rusqlite::Error> for IngestError {
    fn from(e: rusqlite::Error) -> Self {
        IngestError::Fatal(format!("job store: {}", e))
    }
}

/// SQLite-backed job store. Mutations are serialized by the connection
/// mutex; readers share it.
pub struct JobStore {
    conn: Arc<Mutex<Connection>>,
}

impl JobStore {
    /// Open or create the store, then reclaim tasks orphaned by an unclean
    /// shutdown.
    pub fn open(db_path: &Path) -> IngestResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| IngestError::fatal(format!("cannot create db dir: {}", e)))?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .map_err(|e| IngestError::fatal(format!("cannot open {}: {}", db_path.display(), e)))?;
        conn.execute_batch(SCHEMA)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        let reclaimed = store.reclaim_in_progress()?;
        if reclaimed > 0 {
            warn!(reclaimed, "requeued tasks left in_progress by a previous run");
        }
        info!(path = %db_path.display(), "job store opened");
        Ok(store)
    }

    /// In-memory store (tests).
    pub fn open_memory() -> IngestResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a job plus its (ticker × date) task grid in one transaction.
    /// The job starts `queued`; the worker promotes it when a slot frees up.
    pub fn create_job(&self, new_job: &NewJob) -> IngestResult<Job> {
        if new_job.tickers.is_empty() {
            return Err(IngestError::malformed("job needs at least one ticker"));
        }
        if new_job.date_from > new_job.date_until {
            return Err(IngestError::malformed(format!(
                "date_from {} is after date_until {}",
                new_job.date_from, new_job.date_until
            )));
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            tickers: new_job.tickers.clone(),
            date_from: new_job.date_from,
            date_until: new_job.date_until,
            delay_ms: new_job.delay_ms,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            rows_written: 0,
            pages_fetched: 0,
            error_count: 0,
            last_error: None,
        };

        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> IngestResult<()> {
            conn.execute(
                r#"
                INSERT INTO jobs (id, tickers, date_from, date_until, delay_ms, status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    job.id,
                    serde_json::to_string(&job.tickers)
                        .map_err(|e| IngestError::fatal(e.to_string()))?,
                    fmt_date(job.date_from),
                    fmt_date(job.date_until),
                    job.delay_ms as i64,
                    job.status.as_str(),
                    job.created_at.to_rfc3339(),
                ],
            )?;

            let mut date = job.date_from;
            while date <= job.date_until {
                for ticker in &job.tickers {
                    conn.execute(
                        r#"
                        INSERT INTO tasks (job_id, ticker, date, status)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                        params![job.id, ticker, fmt_date(date), TaskStatus::Queued.as_str()],
                    )?;
                }
                date = date
                    .succ_opt()
                    .ok_or_else(|| IngestError::malformed("date out of range"))?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                debug!(job_id = %job.id, tasks = job.tickers.len(), "job created");
                Ok(job)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn load_job(&self, id: &str) -> IngestResult<Option<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tickers, date_from, date_until, delay_ms, status, created_at,
                   started_at, completed_at, rows_written, pages_fetched, error_count, last_error
            FROM jobs WHERE id = ?1
            "#,
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(job_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All jobs, newest first, optionally filtered by status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> IngestResult<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, tickers, date_from, date_until, delay_ms, status, created_at,
                   started_at, completed_at, rows_written, pages_fetched, error_count, last_error
            FROM jobs
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at DESC, rowid DESC
            "#,
        )?;
        let mut rows = stmt.query(params![status.map(|s| s.as_str())])?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next()? {
            jobs.push(job_from_row(row)?);
        }
        Ok(jobs)
    }

    /// Set a job's status. `running` stamps `started_at` on first entry;
    /// terminal statuses stamp `completed_at`.
    pub fn update_job_status(&self, id: &str, status: JobStatus) -> IngestResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let updated = conn.execute(
            r#"
            UPDATE jobs SET
                status = ?2,
                started_at = CASE WHEN ?2 = 'running' THEN COALESCE(started_at, ?3) ELSE started_at END,
                completed_at = CASE WHEN ?2 IN ('completed', 'cancelled', 'failed') THEN ?3 ELSE completed_at END
            WHERE id = ?1
            "#,
            params![id, status.as_str(), now],
        )?;
        if updated == 0 {
            return Err(IngestError::malformed(format!("no such job: {}", id)));
        }
        Ok(())
    }

    /// Record a task-level failure on the job.
    pub fn record_job_error(&self, id: &str, message: &str) -> IngestResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET error_count = error_count + 1, last_error = ?2 WHERE id = ?1",
            params![id, message],
        )?;
        Ok(())
    }

    /// Persist one completed page: the task's new cursor and row count plus
    /// the job's aggregate counters, atomically. This is the write that
    /// makes crash-restart resumption exact.
    pub fn advance_task_cursor(
        &self,
        job_id: &str,
        ticker: &str,
        date: NaiveDate,
        next_cursor: Option<&str>,
        rows_delta: u64,
    ) -> IngestResult<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> IngestResult<()> {
            conn.execute(
                r#"
                UPDATE tasks SET next_cursor = ?4, rows_written = rows_written + ?5
                WHERE job_id = ?1 AND ticker = ?2 AND date = ?3
                "#,
                params![job_id, ticker, fmt_date(date), next_cursor, rows_delta as i64],
            )?;
            conn.execute(
                r#"
                UPDATE jobs SET pages_fetched = pages_fetched + 1,
                                rows_written = rows_written + ?2
                WHERE id = ?1
                "#,
                params![job_id, rows_delta as i64],
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn set_task_status(
        &self,
        job_id: &str,
        ticker: &str,
        date: NaiveDate,
        status: TaskStatus,
    ) -> IngestResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET status = ?4 WHERE job_id = ?1 AND ticker = ?2 AND date = ?3",
            params![job_id, ticker, fmt_date(date), status.as_str()],
        )?;
        Ok(())
    }

    pub fn get_task(&self, job_id: &str, ticker: &str, date: NaiveDate) -> IngestResult<Option<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT job_id, ticker, date, status, next_cursor, rows_written
            FROM tasks WHERE job_id = ?1 AND ticker = ?2 AND date = ?3
            "#,
        )?;
        let mut rows = stmt.query(params![job_id, ticker, fmt_date(date)])?;
        match rows.next()? {
            Some(row) => Ok(Some(task_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// All tasks of a job in creation order.
    pub fn tasks_for_job(&self, job_id: &str) -> IngestResult<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT job_id, ticker, date, status, next_cursor, rows_written
            FROM tasks WHERE job_id = ?1 ORDER BY rowid
            "#,
        )?;
        let mut rows = stmt.query(params![job_id])?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(task_from_row(row)?);
        }
        Ok(tasks)
    }

    /// Oldest queued task belonging to a `running` job, optionally scoped to
    /// one job. Returns `None` when nothing is runnable.
    pub fn pick_next_runnable(&self, job_id: Option<&str>) -> IngestResult<Option<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT t.job_id, t.ticker, t.date, t.status, t.next_cursor, t.rows_written
            FROM tasks t
            JOIN jobs j ON j.id = t.job_id
            WHERE t.status = 'queued'
              AND j.status = 'running'
              AND (?1 IS NULL OR t.job_id = ?1)
            ORDER BY j.created_at, t.rowid
            LIMIT 1
            "#,
        )?;
        let mut rows = stmt.query(params![job_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(task_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Promote the oldest `queued` job to `running`. Returns its id.
    pub fn promote_next_queued_job(&self) -> IngestResult<Option<String>> {
        let id: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id FROM jobs WHERE status = 'queued' ORDER BY created_at, rowid LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?
        };

        match id {
            Some(id) => {
                self.update_job_status(&id, JobStatus::Running)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Requeue tasks stuck `in_progress` (unclean shutdown). Their cursors
    /// are already persisted, so they resume exactly where they stopped.
    pub fn reclaim_in_progress(&self) -> IngestResult<usize> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE tasks SET status = 'queued' WHERE status = 'in_progress'",
            [],
        )?;
        Ok(n)
    }

    pub fn task_counts(&self, job_id: &str) -> IngestResult<TaskCounts> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE job_id = ?1 GROUP BY status")?;
        let mut rows = stmt.query(params![job_id])?;

        let mut by_status: HashMap<String, u64> = HashMap::new();
        while let Some(row) = rows.next()? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            by_status.insert(status, count as u64);
        }

        let get = |s: TaskStatus| by_status.get(s.as_str()).copied().unwrap_or(0);
        Ok(TaskCounts {
            queued: get(TaskStatus::Queued),
            in_progress: get(TaskStatus::InProgress),
            done: get(TaskStatus::Done),
            skipped: get(TaskStatus::Skipped),
            failed: get(TaskStatus::Failed),
        })
    }

    /// If every task of the job is terminal, stamp the job `completed`
    /// (no failures) or `failed` and return the new status.
    pub fn finalize_job_if_complete(&self, job_id: &str) -> IngestResult<Option<JobStatus>> {
        let counts = self.task_counts(job_id)?;
        if counts.total() == 0 || !counts.all_terminal() {
            return Ok(None);
        }

        let status = if counts.failed == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        self.update_job_status(job_id, status)?;
        Ok(Some(status))
    }

    /// Cancel: every non-terminal task becomes `skipped`, the job becomes
    /// `cancelled`, in one transaction.
    pub fn cancel_job(&self, job_id: &str) -> IngestResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> IngestResult<()> {
            conn.execute(
                r#"
                UPDATE tasks SET status = 'skipped'
                WHERE job_id = ?1 AND status IN ('queued', 'in_progress')
                "#,
                params![job_id],
            )?;
            let updated = conn.execute(
                "UPDATE jobs SET status = 'cancelled', completed_at = ?2 WHERE id = ?1",
                params![job_id, now],
            )?;
            if updated == 0 {
                return Err(IngestError::malformed(format!("no such job: {}", job_id)));
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Append to the capped job log.
    pub fn append_log(
        &self,
        level: LogLevel,
        job_id: Option<&str>,
        message: &str,
    ) -> IngestResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO job_logs (ts, level, job_id, message) VALUES (?1, ?2, ?3, ?4)",
            params![
                Utc::now().to_rfc3339(),
                level_str(level),
                job_id,
                message
            ],
        )?;
        conn.execute(
            "DELETE FROM job_logs WHERE id <= (SELECT MAX(id) FROM job_logs) - ?1",
            params![JOB_LOG_CAP],
        )?;
        Ok(())
    }

    /// Most recent persisted log entries, newest last.
    pub fn recent_logs(&self, limit: usize) -> IngestResult<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT ts, level, job_id, message FROM job_logs
            ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit as i64])?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let ts: String = row.get(0)?;
            let level: String = row.get(1)?;
            entries.push(LogEntry {
                ts: parse_instant(&ts)?,
                level: parse_level(&level),
                job_id: row.get(2)?,
                message: row.get(3)?,
            });
        }
        entries.reverse();
        Ok(entries)
    }
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn parse_date(s: &str) -> IngestResult<NaiveDate> {
    s.parse()
        .map_err(|_| IngestError::malformed(format!("bad date in store: {:?}", s)))
}

fn parse_instant(s: &str) -> IngestResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| IngestError::malformed(format!("bad timestamp in store: {:?}", s)))
}

fn parse_opt_instant(s: Option<String>) -> IngestResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_instant(&s)).transpose()
}

fn level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn parse_level(s: &str) -> LogLevel {
    match s {
        "warn" => LogLevel::Warn,
        "error" => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> IngestResult<Job> {
    let tickers_json: String = row.get(1)?;
    let date_from: String = row.get(2)?;
    let date_until: String = row.get(3)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(Job {
        id: row.get(0)?,
        tickers: serde_json::from_str(&tickers_json)
            .map_err(|e| IngestError::malformed(format!("bad tickers in store: {}", e)))?,
        date_from: parse_date(&date_from)?,
        date_until: parse_date(&date_until)?,
        delay_ms: row.get::<_, i64>(4)? as u64,
        status: JobStatus::parse(&status)?,
        created_at: parse_instant(&created_at)?,
        started_at: parse_opt_instant(row.get(7)?)?,
        completed_at: parse_opt_instant(row.get(8)?)?,
        rows_written: row.get::<_, i64>(9)? as u64,
        pages_fetched: row.get::<_, i64>(10)? as u64,
        error_count: row.get::<_, i64>(11)? as u64,
        last_error: row.get(12)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> IngestResult<Task> {
    let date: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Task {
        job_id: row.get(0)?,
        ticker: row.get(1)?,
        date: parse_date(&date)?,
        status: TaskStatus::parse(&status)?,
        next_cursor: row.get(4)?,
        rows_written: row.get::<_, i64>(5)? as u64,
    })
}
