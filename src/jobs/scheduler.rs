//! Background worker draining historical ingestion tasks.
//!
//! Single worker, single task at a time; the worker is the only mutator of
//! task cursors. Pause/resume/cancel and shutdown are flags it re-reads at
//! page boundaries, so an in-flight page always completes (and persists its
//! cursor) before control changes take effect. Auth failures park the whole
//! job in `auth_paused` until a fresh credential arrives; transient failures
//! back off exponentially and eventually fail only the task at hand.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::CredentialStore;
use crate::backoff::Backoff;
use crate::error::{IngestError, IngestResult};
use crate::logbuf::{LogLevel, LogRing};
use crate::rest::{TradePage, TradesApi};
use crate::sink::{CsvSink, Dataset};

use super::store::JobStore;
use super::{JobStatus, Task, TaskStatus};

/// Retry and pacing knobs for the worker.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// First retry delay after a transient page failure.
    pub retry_base: Duration,
    /// Retry delay ceiling.
    pub retry_cap: Duration,
    /// Fetch attempts per page before the task is marked failed.
    pub retry_max_attempts: u32,
    /// Poll interval while no task is runnable.
    pub idle_poll: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(60),
            retry_max_attempts: 5,
            idle_poll: Duration::from_millis(750),
        }
    }
}

impl SchedulerConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("STOCKBIT_SCHED_RETRY_BASE_MS") {
            if let Ok(ms) = v.parse() {
                config.retry_base = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = env::var("STOCKBIT_SCHED_RETRY_CAP_MS") {
            if let Ok(ms) = v.parse() {
                config.retry_cap = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = env::var("STOCKBIT_SCHED_RETRY_MAX_ATTEMPTS") {
            config.retry_max_attempts = v.parse().unwrap_or(config.retry_max_attempts);
        }

        config
    }
}

/// Handle to the spawned worker.
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Signal the worker to stop and wait for it, bounded. An in-flight
    /// page finishes; its cursor is already persisted.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                warn!("scheduler worker did not stop within 10s");
            }
        }
    }
}

/// The worker itself. Constructed through `spawn`.
pub struct Scheduler {
    store: Arc<JobStore>,
    api: Arc<dyn TradesApi>,
    sink: Arc<CsvSink>,
    creds: Arc<CredentialStore>,
    logs: Arc<LogRing>,
    config: SchedulerConfig,
    stop_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn spawn(
        store: Arc<JobStore>,
        api: Arc<dyn TradesApi>,
        sink: Arc<CsvSink>,
        creds: Arc<CredentialStore>,
        logs: Arc<LogRing>,
        config: SchedulerConfig,
    ) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Self {
            store,
            api,
            sink,
            creds,
            logs,
            config,
            stop_rx,
        };

        let task = tokio::spawn(async move { worker.run().await });
        SchedulerHandle {
            stop_tx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    async fn run(self) {
        info!("historical job worker started");

        loop {
            // A closed stop channel means the handle is gone; stop too.
            if *self.stop_rx.borrow() || self.stop_rx.has_changed().is_err() {
                break;
            }

            match self.store.pick_next_runnable(None) {
                Ok(Some(task)) => self.run_task(task).await,
                Ok(None) => {
                    // Nothing runnable: start the oldest queued job, or idle.
                    match self.store.promote_next_queued_job() {
                        Ok(Some(job_id)) => {
                            self.log(LogLevel::Info, Some(&job_id), "job started");
                        }
                        Ok(None) => {
                            self.sleep_cancellable(self.config.idle_poll).await;
                        }
                        Err(e) => {
                            error!(error = %e, "failed to promote queued job");
                            self.sleep_cancellable(self.config.idle_poll).await;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to pick runnable task");
                    self.sleep_cancellable(self.config.idle_poll).await;
                }
            }
        }

        info!("historical job worker stopped");
    }

    /// Paginate one (ticker, date) task to a terminal state or a safe stop.
    async fn run_task(&self, task: Task) {
        let job_id = task.job_id.clone();

        // Credential gate: without a usable token the whole job parks.
        if !self.creds.is_valid() {
            self.log(
                LogLevel::Warn,
                Some(&job_id),
                "credential missing or expired, job auth-paused",
            );
            let _ = self.store.update_job_status(&job_id, JobStatus::AuthPaused);
            return;
        }

        let job = match self.store.load_job(&job_id) {
            Ok(Some(job)) => job,
            _ => return,
        };

        if self
            .store
            .set_task_status(&job_id, &task.ticker, task.date, TaskStatus::InProgress)
            .is_err()
        {
            return;
        }

        debug!(
            job_id = %job_id,
            ticker = %task.ticker,
            date = %task.date,
            cursor = ?task.next_cursor,
            "task started"
        );

        let mut cursor = task.next_cursor.clone();
        let delay = Duration::from_millis(job.delay_ms);

        loop {
            // Safe point: control flags take effect between pages.
            match self.store.load_job(&job_id) {
                Ok(Some(current)) => match current.status {
                    JobStatus::Running => {}
                    JobStatus::Paused | JobStatus::AuthPaused => {
                        let _ = self.store.set_task_status(
                            &job_id,
                            &task.ticker,
                            task.date,
                            TaskStatus::Queued,
                        );
                        debug!(job_id = %job_id, ticker = %task.ticker, "task requeued (job paused)");
                        return;
                    }
                    // Cancelled or otherwise terminal: cancel already skipped
                    // the tasks; leave them untouched.
                    _ => return,
                },
                _ => return,
            }

            if *self.stop_rx.borrow() {
                let _ = self.store.set_task_status(
                    &job_id,
                    &task.ticker,
                    task.date,
                    TaskStatus::Queued,
                );
                return;
            }

            match self
                .fetch_page_with_retry(&task.ticker, task.date, cursor.as_deref())
                .await
            {
                Ok(page) => {
                    let rows: Vec<Vec<String>> = page.rows.iter().map(|t| t.to_row()).collect();

                    if let Err(e) =
                        self.sink
                            .append(Dataset::RunningTrade, &task.ticker, task.date, &rows)
                    {
                        self.log(
                            LogLevel::Error,
                            Some(&job_id),
                            format!("csv write failed for {}: {}", task.ticker, e),
                        );
                        let _ = self.store.record_job_error(&job_id, &e.to_string());
                        let _ = self.store.set_task_status(
                            &job_id,
                            &task.ticker,
                            task.date,
                            TaskStatus::Failed,
                        );
                        break;
                    }

                    if self
                        .store
                        .advance_task_cursor(
                            &job_id,
                            &task.ticker,
                            task.date,
                            page.next_cursor.as_deref(),
                            rows.len() as u64,
                        )
                        .is_err()
                    {
                        break;
                    }

                    match page.next_cursor {
                        None => {
                            let _ = self.store.set_task_status(
                                &job_id,
                                &task.ticker,
                                task.date,
                                TaskStatus::Done,
                            );
                            debug!(job_id = %job_id, ticker = %task.ticker, date = %task.date, "task done");
                            break;
                        }
                        Some(next) => {
                            cursor = Some(next);
                            if !delay.is_zero() && self.sleep_cancellable(delay).await {
                                // Stop requested mid-delay; cursor is persisted.
                                let _ = self.store.set_task_status(
                                    &job_id,
                                    &task.ticker,
                                    task.date,
                                    TaskStatus::Queued,
                                );
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.is_auth_expired() => {
                    self.log(
                        LogLevel::Warn,
                        Some(&job_id),
                        format!("credential rejected by broker: {}", e),
                    );
                    let _ = self.store.set_task_status(
                        &job_id,
                        &task.ticker,
                        task.date,
                        TaskStatus::Queued,
                    );
                    let _ = self.store.update_job_status(&job_id, JobStatus::AuthPaused);
                    return;
                }
                Err(e) => {
                    self.log(
                        LogLevel::Error,
                        Some(&job_id),
                        format!("task {} {} failed: {}", task.ticker, task.date, e),
                    );
                    let _ = self.store.record_job_error(&job_id, &e.to_string());
                    let _ = self.store.set_task_status(
                        &job_id,
                        &task.ticker,
                        task.date,
                        TaskStatus::Failed,
                    );
                    break;
                }
            }
        }

        match self.store.finalize_job_if_complete(&job_id) {
            Ok(Some(status)) => {
                self.log(
                    LogLevel::Info,
                    Some(&job_id),
                    format!("job {}", status.as_str()),
                );
            }
            _ => {}
        }
    }

    /// Fetch one page, retrying transient failures with exponential backoff.
    /// Non-retryable errors and exhaustion propagate to the caller.
    async fn fetch_page_with_retry(
        &self,
        ticker: &str,
        date: chrono::NaiveDate,
        cursor: Option<&str>,
    ) -> IngestResult<TradePage> {
        let mut backoff = Backoff::new(self.config.retry_base, self.config.retry_cap);

        loop {
            match self.api.fetch_trades(ticker, date, cursor).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() => {
                    if backoff.attempt() + 1 >= self.config.retry_max_attempts {
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        ticker,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient page failure, backing off"
                    );
                    if self.sleep_cancellable(delay).await {
                        return Err(IngestError::retryable("stopped during backoff"));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleep unless stop is signalled first. Returns true if stopping.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        if *self.stop_rx.borrow() {
            return true;
        }
        let mut rx = self.stop_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            r = rx.wait_for(|stop| *stop) => {
                let _ = r;
                true
            }
        }
    }

    fn log(&self, level: LogLevel, job_id: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(job_id = ?job_id, "{}", message),
            LogLevel::Warn => warn!(job_id = ?job_id, "{}", message),
            LogLevel::Error => error!(job_id = ?job_id, "{}", message),
        }
        self.logs.push(level, job_id, message.clone());
        let _ = self.store.append_log(level, job_id, &message);
    }
}
