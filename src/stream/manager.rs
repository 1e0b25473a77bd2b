//! Named streaming sessions: start/stop/status, independent lifecycles.
//!
//! Each session runs as its own task; a failure in one never touches the
//! others. Terminal sessions keep their stats around for inspection until
//! the id is reused or the process exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{CredentialStore, TokenRefresher};
use crate::error::{IngestError, IngestResult};
use crate::logbuf::LogRing;
use crate::rest::TradesApi;
use crate::sink::CsvSink;

use super::session::{SessionShared, SessionSnapshot, StreamSession};
use super::StreamConfig;

struct SessionEntry {
    shared: Arc<SessionShared>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Owner of all streaming sessions.
pub struct StreamManager {
    config: StreamConfig,
    api: Arc<dyn TradesApi>,
    creds: Arc<CredentialStore>,
    sink: Arc<CsvSink>,
    logs: Arc<LogRing>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl StreamManager {
    pub fn new(
        config: StreamConfig,
        api: Arc<dyn TradesApi>,
        creds: Arc<CredentialStore>,
        sink: Arc<CsvSink>,
        logs: Arc<LogRing>,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> Self {
        Self {
            config,
            api,
            creds,
            sink,
            logs,
            refresher,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start a session over `tickers`. The id is generated when absent and
    /// must not collide with a live session. `max_retries = None` retries
    /// forever.
    pub fn start_stream(
        &self,
        session_id: Option<String>,
        tickers: Vec<String>,
        max_retries: Option<u32>,
    ) -> IngestResult<String> {
        let tickers: Vec<String> = tickers
            .into_iter()
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
        if tickers.is_empty() {
            return Err(IngestError::malformed(
                "a stream needs at least one ticker",
            ));
        }

        let session_id =
            session_id.unwrap_or_else(|| format!("stream-{}", &Uuid::new_v4().to_string()[..8]));

        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&session_id) {
            if !existing.shared.state().is_terminal() {
                return Err(IngestError::malformed(format!(
                    "session {} already running",
                    session_id
                )));
            }
        }

        let shared = Arc::new(SessionShared::new(session_id.clone(), tickers.clone()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let session = StreamSession {
            shared: shared.clone(),
            config: self.config.clone(),
            api: self.api.clone(),
            creds: self.creds.clone(),
            sink: self.sink.clone(),
            refresher: self.refresher.clone(),
            logs: self.logs.clone(),
            max_retries,
            stop_rx,
        };
        let task = tokio::spawn(session.run());

        sessions.insert(
            session_id.clone(),
            SessionEntry {
                shared,
                stop_tx,
                task: Some(task),
            },
        );

        info!(session_id = %session_id, tickers = ?tickers, "stream started");
        self.logs.info(
            None,
            format!("stream {} started for {}", session_id, tickers.join(",")),
        );
        Ok(session_id)
    }

    /// Signal a session to stop. Idempotent; stats stay queryable.
    pub fn stop_stream(&self, session_id: &str) -> IngestResult<()> {
        let sessions = self.sessions.lock();
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| IngestError::malformed(format!("no such session: {}", session_id)))?;

        let _ = entry.stop_tx.send(true);
        info!(session_id = %session_id, "stream stop requested");
        Ok(())
    }

    /// Snapshot for one session.
    pub fn get_stats(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.shared.snapshot())
    }

    /// Snapshots for every session, oldest first.
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self
            .sessions
            .lock()
            .values()
            .map(|entry| entry.shared.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    /// Stop every session and wait for their tasks, bounded.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut sessions = self.sessions.lock();
            sessions
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let _ = entry.stop_tx.send(true);
                    entry.task.take().map(|task| (id.clone(), task))
                })
                .collect()
        };

        for (session_id, task) in handles {
            if tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_err()
            {
                warn!(session_id = %session_id, "session did not stop within 10s");
            }
        }
        info!("all streams stopped");
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

    struct NoopApi;

    #[async_trait]
    impl TradesApi for NoopApi {
        async fn fetch_trades(
            &self,
            _ticker: &str,
            _date: NaiveDate,
            _cursor: Option<&str>,
        ) -> IngestResult<TradePage> {
            Ok(TradePage::default())
        }

        async fn fetch_trading_key(&self) -> IngestResult<String> {
            // Keeps test sessions in the retry loop without touching the
            // network.
            Err(IngestError::retryable("no broker in tests"))
        }
    }

    fn manager(dir: &tempfile::TempDir) -> StreamManager {
        let creds = Arc::new(CredentialStore::open(dir.path().join("token.json")));
        creds.set("tok", None).unwrap();
        StreamManager::new(
            StreamConfig {
                ws_url: "ws://127.0.0.1:1/ws".to_string(),
                backoff_base: Duration::from_millis(20),
                backoff_max: Duration::from_millis(50),
                ..StreamConfig::default()
            },
            Arc::new(NoopApi),
            creds,
            Arc::new(CsvSink::new(dir.path().join("data")).unwrap()),
            Arc::new(LogRing::new(50)),
            None,
        )
    }

    #[tokio::test]
    async fn test_rejects_empty_tickers() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);

        assert!(mgr.start_stream(None, vec![], None).is_err());
        assert!(mgr
            .start_stream(None, vec!["  ".to_string()], None)
            .is_err());
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_live_session() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);

        mgr.start_stream(Some("s1".to_string()), vec!["BBCA".to_string()], None)
            .unwrap();
        let dup = mgr.start_stream(Some("s1".to_string()), vec!["TLKM".to_string()], None);
        assert!(dup.is_err());

        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_keeps_stats() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);

        let id = mgr
            .start_stream(None, vec!["bbca".to_string()], Some(0))
            .unwrap();
        mgr.stop_stream(&id).unwrap();
        mgr.stop_stream(&id).unwrap();
        mgr.stop_all().await;

        let snap = mgr.get_stats(&id).unwrap();
        // Tickers are normalized to uppercase.
        assert_eq!(snap.tickers, vec!["BBCA"]);
        assert!(snap.state.is_terminal());
        assert!(mgr.stop_stream("missing").is_err());
    }

    #[tokio::test]
    async fn test_terminal_id_can_be_reused() {
        let dir = tempdir().unwrap();
        let mgr = manager(&dir);

        let id = mgr
            .start_stream(Some("s1".to_string()), vec!["BBCA".to_string()], Some(0))
            .unwrap();
        mgr.stop_stream(&id).unwrap();
        mgr.stop_all().await;
        assert!(mgr.get_stats(&id).unwrap().state.is_terminal());

        // Same id is accepted once the previous session is terminal.
        mgr.start_stream(Some("s1".to_string()), vec!["TLKM".to_string()], None)
            .unwrap();
        mgr.stop_all().await;
    }
}
