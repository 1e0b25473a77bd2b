//! Process configuration.
//!
//! Everything is overridable from the environment so deployments never need
//! a config file; code defaults match the broker's production endpoints.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level ingest configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Base URL for historical REST endpoints.
    pub rest_base_url: String,
    /// WebSocket URL for the streaming endpoint.
    pub ws_url: String,
    /// Root of the CSV output tree (`<data_dir>/running_trade/...`).
    pub data_dir: PathBuf,
    /// Jobs database file.
    pub db_path: PathBuf,
    /// Credential file (`token.json`).
    pub token_path: PathBuf,
    /// HTTP request timeout.
    pub http_timeout: Duration,
    /// In-memory log ring capacity.
    pub log_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            rest_base_url: "https://exodus.stockbit.com".to_string(),
            ws_url: "wss://wss-jkt.trading.stockbit.com/ws".to_string(),
            data_dir: PathBuf::from("data"),
            db_path: PathBuf::from("jobs.db"),
            token_path: PathBuf::from("config_data/token.json"),
            http_timeout: Duration::from_secs(30),
            log_capacity: 1000,
        }
    }
}

impl IngestConfig {
    /// Load from environment with defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("STOCKBIT_REST_BASE_URL") {
            config.rest_base_url = v;
        }
        if let Ok(v) = env::var("STOCKBIT_WS_URL") {
            config.ws_url = v;
        }
        if let Ok(v) = env::var("STOCKBIT_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("STOCKBIT_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("STOCKBIT_TOKEN_PATH") {
            config.token_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("STOCKBIT_HTTP_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                config.http_timeout = Duration::from_secs(secs);
            }
        }
        if let Ok(v) = env::var("STOCKBIT_LOG_CAPACITY") {
            config.log_capacity = v.parse().unwrap_or(config.log_capacity);
        }

        config
    }
}
