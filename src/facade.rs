//! Typed control facade over the whole ingest core.
//!
//! Transport-agnostic: an HTTP layer, a CLI, or a test harness all drive
//! the same methods. Owns the background workers (scheduler, stream
//! sessions) and shuts them down within a bounded window.

use std::fs::File;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::auth::{CredentialStatus, CredentialStore, TokenRefresher};
use crate::config::IngestConfig;
use crate::jobs::{
    Job, JobStatus, JobStore, NewJob, Scheduler, SchedulerConfig, SchedulerHandle, Task, TaskCounts,
};
use crate::logbuf::{LogEntry, LogRing};
use crate::rest::{StockbitClient, TradesApi};
use crate::sink::{CsvFileInfo, CsvSink, Dataset};
use crate::stream::{SessionSnapshot, StreamConfig, StreamManager};

/// A job with its per-task breakdown.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub counts: TaskCounts,
    pub tasks: Vec<Task>,
}

/// The programmatic API for the ingest core.
pub struct IngestHub {
    creds: Arc<CredentialStore>,
    sink: Arc<CsvSink>,
    store: Arc<JobStore>,
    logs: Arc<LogRing>,
    streams: StreamManager,
    scheduler: SchedulerHandle,
}

impl IngestHub {
    /// Build and start the core against the production REST client. Must be
    /// called from within a tokio runtime; fails fast when the data
    /// directories or the job database cannot be opened.
    pub fn start(config: IngestConfig) -> Result<Self> {
        let creds = Arc::new(CredentialStore::open(config.token_path.clone()));
        let api: Arc<dyn TradesApi> = Arc::new(
            StockbitClient::new(&config.rest_base_url, creds.clone(), config.http_timeout)
                .context("failed to build REST client")?,
        );
        Self::start_inner(config, creds, api, None)
    }

    /// Same as `start` but with an injected REST implementation (tests,
    /// alternative brokers) and an optional pre-connect refresh hook.
    pub fn start_with_api(
        config: IngestConfig,
        api: Arc<dyn TradesApi>,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Result<Self> {
        let creds = Arc::new(CredentialStore::open(config.token_path.clone()));
        Self::start_inner(config, creds, api, refresher)
    }

    fn start_inner(
        config: IngestConfig,
        creds: Arc<CredentialStore>,
        api: Arc<dyn TradesApi>,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Result<Self> {
        let sink = Arc::new(
            CsvSink::new(config.data_dir.clone()).context("failed to prepare data directory")?,
        );
        let store =
            Arc::new(JobStore::open(&config.db_path).context("failed to open job database")?);
        let logs = Arc::new(LogRing::new(config.log_capacity));

        let stream_config = StreamConfig {
            ws_url: config.ws_url.clone(),
            ..StreamConfig::from_env()
        };
        let streams = StreamManager::new(
            stream_config,
            api.clone(),
            creds.clone(),
            sink.clone(),
            logs.clone(),
            refresher,
        );

        let scheduler = Scheduler::spawn(
            store.clone(),
            api,
            sink.clone(),
            creds.clone(),
            logs.clone(),
            SchedulerConfig::from_env(),
        );

        info!("ingest core started");
        Ok(Self {
            creds,
            sink,
            store,
            logs,
            streams,
            scheduler,
        })
    }

    // -------------------------------------------------------------------------
    // Credentials
    // -------------------------------------------------------------------------

    pub fn set_token(&self, token: &str, cookies: Option<&str>) -> Result<CredentialStatus> {
        self.creds
            .set(token, cookies)
            .context("failed to persist credential")?;
        self.logs.info(None, "credential updated");
        Ok(self.creds.status())
    }

    pub fn credential_status(&self) -> CredentialStatus {
        self.creds.status()
    }

    pub fn clear_token(&self) -> Result<()> {
        self.creds.clear().context("failed to clear credential")?;
        self.logs.info(None, "credential cleared");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Historical jobs
    // -------------------------------------------------------------------------

    pub fn create_job(&self, new_job: NewJob) -> Result<Job> {
        let job = self.store.create_job(&new_job)?;
        self.logs.info(
            Some(&job.id),
            format!(
                "job created: {} tickers, {}..{}",
                job.tickers.len(),
                job.date_from,
                job.date_until
            ),
        );
        Ok(job)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs(None)?)
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobDetail>> {
        let job = match self.store.load_job(job_id)? {
            Some(job) => job,
            None => return Ok(None),
        };
        Ok(Some(JobDetail {
            counts: self.store.task_counts(job_id)?,
            tasks: self.store.tasks_for_job(job_id)?,
            job,
        }))
    }

    /// Pause a job. The in-flight page, if any, completes first; its task
    /// drains back to the queue with the cursor persisted. Pausing an
    /// already paused job is a no-op.
    pub fn pause_job(&self, job_id: &str) -> Result<Job> {
        let job = self.require_job(job_id)?;
        match job.status {
            JobStatus::Paused => return Ok(job),
            JobStatus::Running | JobStatus::Queued => {
                self.store.update_job_status(job_id, JobStatus::Paused)?;
                self.logs.info(Some(job_id), "job paused");
            }
            other => bail!("cannot pause job in status {}", other.as_str()),
        }
        self.require_job(job_id)
    }

    /// Resume a paused (or auth-paused, once a fresh token is set) job.
    /// Tasks continue from their persisted cursors.
    pub fn resume_job(&self, job_id: &str) -> Result<Job> {
        let job = self.require_job(job_id)?;
        match job.status {
            JobStatus::Running => return Ok(job),
            JobStatus::Paused | JobStatus::AuthPaused => {
                self.store.update_job_status(job_id, JobStatus::Running)?;
                self.logs.info(Some(job_id), "job resumed");
            }
            other => bail!("cannot resume job in status {}", other.as_str()),
        }
        self.require_job(job_id)
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<Job> {
        let job = self.require_job(job_id)?;
        match job.status {
            JobStatus::Cancelled => return Ok(job),
            s if s.is_terminal() => bail!("cannot cancel job in status {}", s.as_str()),
            _ => {
                self.store.cancel_job(job_id)?;
                self.logs.info(Some(job_id), "job cancelled");
            }
        }
        self.require_job(job_id)
    }

    pub fn recent_logs(&self, limit: usize) -> Vec<LogEntry> {
        self.logs.recent(limit)
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    pub fn start_stream(
        &self,
        tickers: Vec<String>,
        session_id: Option<String>,
        max_retries: Option<u32>,
    ) -> Result<String> {
        Ok(self.streams.start_stream(session_id, tickers, max_retries)?)
    }

    pub fn list_streams(&self) -> Vec<SessionSnapshot> {
        self.streams.list()
    }

    pub fn get_stream(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.streams.get_stats(session_id)
    }

    pub fn stop_stream(&self, session_id: &str) -> Result<()> {
        Ok(self.streams.stop_stream(session_id)?)
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    pub fn list_csv(&self, dataset: Dataset) -> Result<Vec<CsvFileInfo>> {
        Ok(self.sink.list_files(dataset)?)
    }

    pub fn open_csv_for_read(&self, relative_path: &str) -> Result<File> {
        Ok(self.sink.open_for_read(relative_path)?)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Stop all sessions and the scheduler worker, bounded.
    pub async fn shutdown(&self) {
        self.streams.stop_all().await;
        self.scheduler.shutdown().await;
        info!("ingest core stopped");
    }

    fn require_job(&self, job_id: &str) -> Result<Job> {
        self.store
            .load_job(job_id)?
            .with_context(|| format!("no such job: {}", job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestResult;
    use crate::rest::TradePage;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    /// Always-empty broker: every task completes with zero rows.
    struct EmptyApi;

    #[async_trait]
    impl TradesApi for EmptyApi {
        async fn fetch_trades(
            &self,
            _ticker: &str,
            _date: NaiveDate,
            _cursor: Option<&str>,
        ) -> IngestResult<TradePage> {
            Ok(TradePage::default())
        }

        async fn fetch_trading_key(&self) -> IngestResult<String> {
            Ok("K".to_string())
        }
    }

    fn hub_in(dir: &tempfile::TempDir) -> IngestHub {
        let config = IngestConfig {
            data_dir: dir.path().join("data"),
            db_path: dir.path().join("jobs.db"),
            token_path: dir.path().join("config_data/token.json"),
            ..IngestConfig::default()
        };
        IngestHub::start_with_api(config, Arc::new(EmptyApi), None).unwrap()
    }

    fn new_job() -> NewJob {
        NewJob {
            tickers: vec!["BBCA".to_string()],
            date_from: "2025-11-03".parse().unwrap(),
            date_until: "2025-11-03".parse().unwrap(),
            delay_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_credential_roundtrip() {
        let dir = tempdir().unwrap();
        let hub = hub_in(&dir);

        assert!(!hub.credential_status().present);

        let status = hub.set_token("some-token", Some("sid=1")).unwrap();
        assert!(status.present);
        assert!(status.valid);

        hub.clear_token().unwrap();
        assert!(!hub.credential_status().present);
        assert!(!hub.recent_logs(10).is_empty());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let dir = tempdir().unwrap();
        let hub = hub_in(&dir);

        let job = hub.create_job(new_job()).unwrap();
        let paused = hub.pause_job(&job.id).unwrap();
        assert_eq!(paused.status, JobStatus::Paused);

        // Second pause: no-op success.
        let again = hub.pause_job(&job.id).unwrap();
        assert_eq!(again.status, JobStatus::Paused);

        let resumed = hub.resume_job(&job.id).unwrap();
        assert_eq!(resumed.status, JobStatus::Running);

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_and_detail() {
        let dir = tempdir().unwrap();
        let hub = hub_in(&dir);

        let job = hub.create_job(new_job()).unwrap();
        hub.pause_job(&job.id).unwrap();
        let cancelled = hub.cancel_job(&job.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        // Cancel again: no-op. Resume: client error.
        assert_eq!(
            hub.cancel_job(&job.id).unwrap().status,
            JobStatus::Cancelled
        );
        assert!(hub.resume_job(&job.id).is_err());

        let detail = hub.get_job(&job.id).unwrap().unwrap();
        assert_eq!(detail.counts.skipped, 1);
        assert_eq!(detail.tasks.len(), 1);
        assert!(hub.get_job("missing").unwrap().is_none());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_validation_via_facade() {
        let dir = tempdir().unwrap();
        let hub = hub_in(&dir);

        assert!(hub.start_stream(vec![], None, None).is_err());
        assert!(hub.list_streams().is_empty());

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_csv_empty_then_populated() {
        let dir = tempdir().unwrap();
        let hub = hub_in(&dir);

        assert!(hub.list_csv(Dataset::RunningTrade).unwrap().is_empty());
        hub.sink
            .append(
                Dataset::RunningTrade,
                "BBCA",
                "2025-11-03".parse().unwrap(),
                &[vec!["r".to_string(); 14]],
            )
            .unwrap();

        let files = hub.list_csv(Dataset::RunningTrade).unwrap();
        assert_eq!(files.len(), 1);
        assert!(hub.open_csv_for_read("running_trade/2025-11-03_BBCA.csv").is_ok());
        assert!(hub.open_csv_for_read("../jobs.db").is_err());

        hub.shutdown().await;
    }
}
