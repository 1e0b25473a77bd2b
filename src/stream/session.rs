//! One streaming session: a WebSocket subscription over a set of tickers.
//!
//! State machine:
//!
//! ```text
//! disconnected -> connecting -> connected -> retrying -> connecting ...
//!                      |             |            |
//!                      |             +-- stop --> stopped
//!                      |             +-- retries exhausted --> errored
//!                      +-- stop ---> stopped
//! ```
//!
//! Entering `connecting` runs the credential refresh hook, fetches a fresh
//! trading key, opens the socket with auth headers, and sends the single
//! binary subscription frame. The read loop decodes orderbook frames and
//! appends per-level rows to the CSV sink; a heartbeat arm pings on a fixed
//! cadence and treats prolonged silence after a ping as a dead connection.
//! Reconnect delay is min(base * 2^(n-1), max); the counter resets once
//! connected. Malformed frames are dropped and counted, never fatal.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::auth::{CredentialStore, TokenRefresher};
use crate::backoff::Backoff;
use crate::error::{IngestError, IngestResult};
use crate::logbuf::LogRing;
use crate::rest::TradesApi;
use crate::sink::{CsvSink, Dataset};
use crate::wire::{self, OrderbookFrame, OrderbookUpdate};

use super::StreamConfig;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Retrying => "retrying",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared between a session task and the manager.
pub struct SessionShared {
    pub session_id: String,
    pub tickers: Vec<String>,
    state: RwLock<SessionState>,
    retry_count: AtomicU32,
    total_reconnects: AtomicU64,
    frames_dropped: AtomicU64,
    last_error: RwLock<Option<String>>,
    started_at: DateTime<Utc>,
    last_disconnect_at: RwLock<Option<DateTime<Utc>>>,
    messages_per_ticker: Mutex<HashMap<String, u64>>,
}

impl SessionShared {
    pub fn new(session_id: String, tickers: Vec<String>) -> Self {
        Self {
            session_id,
            tickers,
            state: RwLock::new(SessionState::Disconnected),
            retry_count: AtomicU32::new(0),
            total_reconnects: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            last_error: RwLock::new(None),
            started_at: Utc::now(),
            last_disconnect_at: RwLock::new(None),
            messages_per_ticker: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        let previous = {
            let mut guard = self.state.write();
            std::mem::replace(&mut *guard, state)
        };
        if previous != state {
            debug!(
                session_id = %self.session_id,
                from = %previous,
                to = %state,
                "session state"
            );
        }
    }

    fn record_error(&self, message: &str) {
        *self.last_error.write() = Some(message.to_string());
        *self.last_disconnect_at.write() = Some(Utc::now());
    }

    fn count_message(&self, ticker: &str) {
        *self
            .messages_per_ticker
            .lock()
            .entry(ticker.to_string())
            .or_insert(0) += 1;
    }

    /// Read-only snapshot for status queries.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            tickers: self.tickers.clone(),
            state: self.state(),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            total_reconnects: self.total_reconnects.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
            started_at: self.started_at,
            last_disconnect_at: *self.last_disconnect_at.read(),
            messages_per_ticker: self.messages_per_ticker.lock().clone(),
        }
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub tickers: Vec<String>,
    pub state: SessionState,
    pub retry_count: u32,
    pub total_reconnects: u64,
    pub frames_dropped: u64,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_disconnect_at: Option<DateTime<Utc>>,
    pub messages_per_ticker: HashMap<String, u64>,
}

/// A running session task. Owns its WebSocket exclusively.
pub struct StreamSession {
    pub(super) shared: Arc<SessionShared>,
    pub(super) config: StreamConfig,
    pub(super) api: Arc<dyn TradesApi>,
    pub(super) creds: Arc<CredentialStore>,
    pub(super) sink: Arc<CsvSink>,
    pub(super) refresher: Option<Arc<dyn TokenRefresher>>,
    pub(super) logs: Arc<LogRing>,
    pub(super) max_retries: Option<u32>,
    pub(super) stop_rx: watch::Receiver<bool>,
}

impl StreamSession {
    pub async fn run(mut self) {
        let mut connected_before = false;

        loop {
            if *self.stop_rx.borrow() {
                self.shared.set_state(SessionState::Stopped);
                break;
            }

            self.shared.set_state(SessionState::Connecting);

            match self.connect_and_stream(&mut connected_before).await {
                Ok(()) => {
                    // Clean stop requested from the manager.
                    self.shared.set_state(SessionState::Stopped);
                    break;
                }
                Err(e) => {
                    self.shared.record_error(&e.to_string());
                    self.logs.warn(
                        None,
                        format!("stream {} disconnected: {}", self.shared.session_id, e),
                    );

                    if *self.stop_rx.borrow() {
                        self.shared.set_state(SessionState::Stopped);
                        break;
                    }

                    let retries = self.shared.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(max) = self.max_retries {
                        if retries > max {
                            warn!(
                                session_id = %self.shared.session_id,
                                retries,
                                "retries exhausted, session errored"
                            );
                            self.shared.set_state(SessionState::Errored);
                            break;
                        }
                    }

                    let delay = Backoff::new(self.config.backoff_base, self.config.backoff_max)
                        .delay_for(retries);
                    info!(
                        session_id = %self.shared.session_id,
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        "reconnecting after backoff"
                    );
                    self.shared.set_state(SessionState::Retrying);

                    if self.sleep_cancellable(delay).await {
                        self.shared.set_state(SessionState::Stopped);
                        break;
                    }
                }
            }
        }

        info!(session_id = %self.shared.session_id, state = %self.shared.state(), "session ended");
    }

    /// One connection lifetime. `Ok(())` means stop was requested; every
    /// other exit is an error that feeds the retry policy.
    async fn connect_and_stream(&mut self, connected_before: &mut bool) -> IngestResult<()> {
        // Externally driven refresh first, best effort.
        if let Some(refresher) = &self.refresher {
            if let Err(e) = refresher.refresh(&self.creds).await {
                warn!(session_id = %self.shared.session_id, error = %e, "token refresh hook failed");
            }
        }

        let trading_key = self.api.fetch_trading_key().await?;

        let token = self
            .creds
            .get_token()
            .ok_or_else(|| IngestError::auth("no credential for streaming"))?;
        let user_id = self.creds.user_id().unwrap_or(0).max(0) as u64;

        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| IngestError::retryable(format!("bad websocket url: {}", e)))?;
        if let Ok(value) = format!("Bearer {}", token).parse() {
            request.headers_mut().insert("Authorization", value);
        }
        if let Some(cookies) = self.creds.cookie_header() {
            if let Ok(value) = cookies.parse() {
                request.headers_mut().insert("Cookie", value);
            }
        }

        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| IngestError::retryable(format!("websocket connect: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        let frame = wire::encode_subscribe(user_id, &self.shared.tickers, &trading_key, &token);
        write
            .send(Message::Binary(frame))
            .await
            .map_err(|e| IngestError::retryable(format!("subscription send: {}", e)))?;

        self.shared.set_state(SessionState::Connected);
        self.shared.retry_count.store(0, Ordering::Relaxed);
        if *connected_before {
            self.shared.total_reconnects.fetch_add(1, Ordering::Relaxed);
        } else {
            *connected_before = true;
        }
        info!(
            session_id = %self.shared.session_id,
            tickers = self.shared.tickers.len(),
            "stream connected and subscribed"
        );

        // Read loop. Only this loop decodes frames; only the heartbeat arm
        // writes pings.
        let mut ping_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        let mut awaiting_pong_since: Option<Instant> = None;
        let mut stop_rx = self.stop_rx.clone();

        let pong_timeout = self.config.pong_timeout;
        loop {
            let pong_at = awaiting_pong_since;
            let pong_deadline = async move {
                match pong_at {
                    Some(since) => tokio::time::sleep_until((since + pong_timeout).into()).await,
                    None => std::future::pending().await,
                }
            };

            let wait_stop = async {
                if *stop_rx.borrow() {
                    return;
                }
                let _ = stop_rx.changed().await;
            };

            tokio::select! {
                _ = wait_stop => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping_timer.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| IngestError::retryable(format!("ping send: {}", e)))?;
                    if awaiting_pong_since.is_none() {
                        awaiting_pong_since = Some(Instant::now());
                    }
                }
                _ = pong_deadline => {
                    return Err(IngestError::retryable("no data or pong within timeout"));
                }
                message = read.next() => {
                    // Any inbound traffic counts as liveness.
                    awaiting_pong_since = None;
                    match message {
                        Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                        Some(Ok(Message::Ping(payload))) => {
                            write
                                .send(Message::Pong(payload))
                                .await
                                .map_err(|e| IngestError::retryable(format!("pong send: {}", e)))?;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            return Err(IngestError::retryable(format!(
                                "closed by server: {:?}",
                                frame
                            )));
                        }
                        Some(Ok(other)) => {
                            debug!(session_id = %self.shared.session_id, "ignoring message: {:?}", other);
                        }
                        Some(Err(e)) => {
                            return Err(IngestError::retryable(format!("websocket read: {}", e)));
                        }
                        None => {
                            return Err(IngestError::retryable("websocket stream ended"));
                        }
                    }
                }
            }
        }
    }

    /// Decode one binary message and persist it. Malformed frames are
    /// dropped and counted; the connection stays up.
    fn handle_binary(&self, data: &[u8]) {
        match persist_orderbook_frame(&self.sink, data) {
            Ok(ticker) => self.shared.count_message(&ticker),
            Err(e) => {
                self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    session_id = %self.shared.session_id,
                    error = %e,
                    "dropped undecodable frame"
                );
            }
        }
    }

    async fn sleep_cancellable(&self, duration: std::time::Duration) -> bool {
        let mut rx = self.stop_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            r = rx.wait_for(|stop| *stop) => {
                let _ = r;
                true
            }
        }
    }
}

/// Decode a binary frame and append its levels to the orderbook CSV for the
/// timestamp's UTC date. Returns the ticker written.
pub(crate) fn persist_orderbook_frame(sink: &CsvSink, data: &[u8]) -> IngestResult<String> {
    let frame = OrderbookFrame::decode(data)?;
    let ticker = frame.ticker()?.to_string();

    let mut update = OrderbookUpdate::parse_payload(frame.payload()?)?;
    update.server_timestamp = frame.server_timestamp();

    let timestamp = update
        .server_timestamp
        .clone()
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    let date = row_date(&timestamp);

    let rows: Vec<Vec<String>> = update
        .levels
        .iter()
        .map(|level| {
            vec![
                timestamp.clone(),
                level.price.clone(),
                level.lots.to_string(),
                level.total_value.clone(),
                update.side.as_str().to_string(),
            ]
        })
        .collect();

    sink.append(Dataset::Orderbook, &ticker, date, &rows)?;
    Ok(ticker)
}

/// UTC date for a server timestamp. Unix seconds and milliseconds and
/// RFC 3339 are recognized; anything else dates the row "now" (UTC).
fn row_date(timestamp: &str) -> NaiveDate {
    if let Ok(numeric) = timestamp.parse::<i64>() {
        let secs = if timestamp.len() >= 13 {
            numeric / 1000
        } else {
            numeric
        };
        if let Some(dt) = Utc.timestamp_opt(secs, 0).single() {
            return dt.date_naive();
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(timestamp) {
        return dt.with_timezone(&Utc).date_naive();
    }
    Utc::now().date_naive()
}
