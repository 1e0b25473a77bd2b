//! Authenticated REST client for the broker's historical endpoints.
//!
//! Two calls: the paginated running-trade endpoint and the short auxiliary
//! endpoint that issues the per-session trading key for streaming. The
//! client classifies failures into the ingest error taxonomy but never
//! retries; retry policy belongs to the caller (the scheduler backs off,
//! sessions reconnect).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::CredentialStore;
use crate::error::{IngestError, IngestResult};

const RUNNING_TRADE_PATH: &str = "/order-trade/running-trade";
const WEBSOCKET_KEY_PATH: &str = "/auth/websocket/key";

/// One historical trade as returned by the running-trade endpoint. All
/// fields are carried as strings; the CSV column order matches
/// `Dataset::RunningTrade.columns()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningTrade {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub change: String,
    #[serde(default)]
    pub lot: String,
    #[serde(default)]
    pub buyer: String,
    #[serde(default)]
    pub seller: String,
    #[serde(default)]
    pub trade_number: String,
    #[serde(default)]
    pub buyer_type: String,
    #[serde(default)]
    pub seller_type: String,
    #[serde(default)]
    pub market_board: String,
}

impl RunningTrade {
    /// CSV row in fixed column order.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.date.clone(),
            self.time.clone(),
            self.action.clone(),
            self.code.clone(),
            self.price.clone(),
            self.change.clone(),
            self.lot.clone(),
            self.buyer.clone(),
            self.seller.clone(),
            self.trade_number.clone(),
            self.buyer_type.clone(),
            self.seller_type.clone(),
            self.market_board.clone(),
        ]
    }
}

/// One page of trades. `next_cursor = None` means the walk is complete.
#[derive(Debug, Clone, Default)]
pub struct TradePage {
    pub rows: Vec<RunningTrade>,
    pub next_cursor: Option<String>,
}

/// The REST seam the scheduler and streaming sessions depend on. Production
/// uses `StockbitClient`; tests substitute scripted stubs.
#[async_trait]
pub trait TradesApi: Send + Sync {
    /// Fetch one page. `cursor = None` asks for the most recent page; each
    /// returned cursor walks further back in time.
    async fn fetch_trades(
        &self,
        ticker: &str,
        date: NaiveDate,
        cursor: Option<&str>,
    ) -> IngestResult<TradePage>;

    /// Fetch the trading key required by the streaming subscription frame.
    async fn fetch_trading_key(&self) -> IngestResult<String>;
}

#[derive(Debug, Deserialize)]
struct TradesEnvelope {
    #[serde(default)]
    data: TradesData,
}

#[derive(Debug, Default, Deserialize)]
struct TradesData {
    #[serde(default)]
    running_trade: Vec<RunningTrade>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeyEnvelope {
    data: KeyData,
}

#[derive(Debug, Deserialize)]
struct KeyData {
    key: String,
}

/// Map an HTTP status to the ingest taxonomy.
fn classify_status(status: StatusCode, body_snippet: &str) -> IngestError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            IngestError::auth(format!("HTTP {}: {}", status.as_u16(), body_snippet))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            IngestError::retryable(format!("HTTP 429: {}", body_snippet))
        }
        s if s.is_server_error() => {
            IngestError::retryable(format!("HTTP {}: {}", s.as_u16(), body_snippet))
        }
        s => IngestError::malformed(format!("unexpected HTTP {}: {}", s.as_u16(), body_snippet)),
    }
}

/// Transport-level failures (connect, timeout, TLS) are all transient.
fn classify_transport(e: reqwest::Error) -> IngestError {
    IngestError::retryable(format!("request failed: {}", e))
}

/// Authenticated client against the exodus REST API.
pub struct StockbitClient {
    http: Client,
    base_url: String,
    creds: Arc<CredentialStore>,
}

impl StockbitClient {
    pub fn new(base_url: &str, creds: Arc<CredentialStore>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            creds,
        })
    }

    async fn get_text(&self, path: &str, query: &[(&str, String)]) -> IngestResult<String> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.http.get(&url).query(query);
        if let Some(token) = self.creds.get_token() {
            request = request.bearer_auth(token);
        }
        if let Some(cookies) = self.creds.cookie_header() {
            request = request.header(reqwest::header::COOKIE, cookies);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            let snippet: String = body.chars().take(200).collect();
            return Err(classify_status(status, &snippet));
        }
        Ok(body)
    }
}

#[async_trait]
impl TradesApi for StockbitClient {
    async fn fetch_trades(
        &self,
        ticker: &str,
        date: NaiveDate,
        cursor: Option<&str>,
    ) -> IngestResult<TradePage> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", ticker.to_string()),
            ("date", date_str),
        ];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }

        let body = self.get_text(RUNNING_TRADE_PATH, &query).await?;
        let envelope: TradesEnvelope = serde_json::from_str(&body)
            .map_err(|e| IngestError::malformed(format!("running-trade response: {}", e)))?;

        let next_cursor = envelope
            .data
            .next_cursor
            .filter(|c| !c.is_empty());

        debug!(
            ticker,
            rows = envelope.data.running_trade.len(),
            has_next = next_cursor.is_some(),
            "fetched running-trade page"
        );

        Ok(TradePage {
            rows: envelope.data.running_trade,
            next_cursor,
        })
    }

    async fn fetch_trading_key(&self) -> IngestResult<String> {
        let body = self.get_text(WEBSOCKET_KEY_PATH, &[]).await?;
        let envelope: KeyEnvelope = serde_json::from_str(&body)
            .map_err(|e| IngestError::malformed(format!("websocket-key response: {}", e)))?;
        Ok(envelope.data.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_auth_expired());
        assert!(classify_status(StatusCode::FORBIDDEN, "").is_auth_expired());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "").is_retryable());
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, "").kind(),
            "malformed"
        );
    }

    #[test]
    fn test_trade_row_column_order() {
        let trade = RunningTrade {
            id: "1".into(),
            date: "2025-11-03".into(),
            time: "09:00:01".into(),
            action: "buy".into(),
            code: "BBRI".into(),
            price: "4820".into(),
            change: "+10".into(),
            lot: "25".into(),
            buyer: "YP".into(),
            seller: "PD".into(),
            trade_number: "77".into(),
            buyer_type: "D".into(),
            seller_type: "F".into(),
            market_board: "RG".into(),
        };
        let row = trade.to_row();
        assert_eq!(row.len(), crate::sink::Dataset::RunningTrade.columns().len());
        assert_eq!(row[0], "1");
        assert_eq!(row[4], "BBRI");
        assert_eq!(row[13], "RG");
    }

    #[test]
    fn test_envelope_parse_tolerates_missing_fields() {
        let body = r#"{"data":{"running_trade":[{"id":"9","code":"BBCA"}]}}"#;
        let envelope: TradesEnvelope = serde_json::from_str(body).unwrap();
        assert_eq!(envelope.data.running_trade.len(), 1);
        assert_eq!(envelope.data.running_trade[0].id, "9");
        assert_eq!(envelope.data.running_trade[0].price, "");
        assert!(envelope.data.next_cursor.is_none());
    }

    #[test]
    fn test_empty_cursor_means_done() {
        let body = r#"{"data":{"running_trade":[],"next_cursor":""}}"#;
        let envelope: TradesEnvelope = serde_json::from_str(body).unwrap();
        assert!(envelope.data.next_cursor.unwrap().is_empty());
        // fetch_trades() filters empty cursors to None; mirrored here.
        let filtered = Some(String::new()).filter(|c: &String| !c.is_empty());
        assert!(filtered.is_none());
    }
}
