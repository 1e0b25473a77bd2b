//! Real-time orderbook streaming.
//!
//! One WebSocket per session, subscribed once, fanning out per-ticker
//! updates to the CSV sink. Sessions reconnect on their own with
//! exponential backoff and refresh credentials before each connect.

pub mod manager;
pub mod session;

pub use manager::StreamManager;
pub use session::{SessionSnapshot, SessionState};

use std::env;
use std::time::Duration;

/// Streaming connection configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint.
    pub ws_url: String,
    /// Application-level ping cadence.
    pub ping_interval: Duration,
    /// How long after a ping silence counts as a dead connection.
    pub pong_timeout: Duration,
    /// First reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay ceiling.
    pub backoff_max: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://wss-jkt.trading.stockbit.com/ws".to_string(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

impl StreamConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("STOCKBIT_WS_URL") {
            config.ws_url = v;
        }
        if let Ok(v) = env::var("STOCKBIT_WS_PING_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                config.ping_interval = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = env::var("STOCKBIT_WS_PONG_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                config.pong_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = env::var("STOCKBIT_WS_BACKOFF_BASE_MS") {
            if let Ok(ms) = v.parse() {
                config.backoff_base = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = env::var("STOCKBIT_WS_BACKOFF_MAX_MS") {
            if let Ok(ms) = v.parse() {
                config.backoff_max = Duration::from_millis(ms);
            }
        }

        config
    }
}
