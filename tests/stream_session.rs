//! Streaming integration tests against a loopback WebSocket server.
//!
//! The stub broker accepts a connection, validates the binary subscription
//! frame, emits one orderbook frame per subscribed ticker, and closes. That
//! drives the full session loop: connect, subscribe, decode, persist,
//! reconnect with backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use stockbit_ingest::auth::CredentialStore;
use stockbit_ingest::error::IngestResult;
use stockbit_ingest::logbuf::LogRing;
use stockbit_ingest::rest::{TradePage, TradesApi};
use stockbit_ingest::sink::{CsvSink, Dataset};
use stockbit_ingest::stream::{SessionState, StreamConfig, StreamManager};
use stockbit_ingest::wire::{self, Field, OrderbookFrame};

const TRADING_KEY: &str = "K";
const TOKEN: &str = "integration-token";
// 2025-11-03T17:00:00Z.
const SERVER_TS: &str = "1762189200";

struct KeyOnlyApi;

#[async_trait]
impl TradesApi for KeyOnlyApi {
    async fn fetch_trades(
        &self,
        _ticker: &str,
        _date: NaiveDate,
        _cursor: Option<&str>,
    ) -> IngestResult<TradePage> {
        Ok(TradePage::default())
    }

    async fn fetch_trading_key(&self) -> IngestResult<String> {
        Ok(TRADING_KEY.to_string())
    }
}

/// Start a stub broker. Every accepted connection reads the subscription
/// frame, records its raw bytes, answers with one orderbook frame per
/// plain-form ticker, then closes.
async fn spawn_stub_broker(subscriptions: Arc<Mutex<Vec<Vec<u8>>>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());

    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let subscriptions = subscriptions.clone();

            tokio::spawn(async move {
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };

                if let Some(Ok(Message::Binary(data))) = ws.next().await {
                    let decoded = match wire::decode_subscribe(&data) {
                        Ok(decoded) => decoded,
                        // Malformed subscription: hang up without frames so
                        // the test times out visibly.
                        Err(_) => return,
                    };
                    subscriptions.lock().push(data);

                    // Plain tickers are every 4th channel entry.
                    let tickers: Vec<String> =
                        decoded.channels.iter().step_by(4).cloned().collect();
                    for ticker in tickers {
                        let frame = OrderbookFrame::from_parts(
                            &ticker,
                            &format!("#O|{}|BID|9550;12;11460000", ticker),
                            vec![Field::string(5, SERVER_TS)],
                        );
                        if ws.send(Message::Binary(frame.encode())).await.is_err() {
                            return;
                        }
                    }
                }

                let _ = ws.close(None).await;
            });
        }
    });

    url
}

struct Harness {
    manager: StreamManager,
    sink: Arc<CsvSink>,
    subscriptions: Arc<Mutex<Vec<Vec<u8>>>>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let subscriptions = Arc::new(Mutex::new(Vec::new()));
    let ws_url = spawn_stub_broker(subscriptions.clone()).await;

    let creds = Arc::new(CredentialStore::open(dir.path().join("token.json")));
    creds.set(TOKEN, None).unwrap();

    let sink = Arc::new(CsvSink::new(dir.path().join("data")).unwrap());
    let manager = StreamManager::new(
        StreamConfig {
            ws_url,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(400),
            ..StreamConfig::default()
        },
        Arc::new(KeyOnlyApi),
        creds,
        sink.clone(),
        Arc::new(LogRing::new(100)),
        None,
    );

    Harness {
        manager,
        sink,
        subscriptions,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_streaming_reconnect_cycle() {
    let h = harness().await;

    let session_id = h
        .manager
        .start_stream(
            Some("it-1".to_string()),
            vec!["BBCA".to_string(), "TLKM".to_string()],
            None,
        )
        .unwrap();

    // Wait until the session has reconnected at least once and is connected
    // again; the retry counter must be reset at that point.
    let mut reconnected = false;
    for _ in 0..300 {
        if let Some(snap) = h.manager.get_stats(&session_id) {
            if snap.total_reconnects >= 1 && snap.state == SessionState::Connected {
                assert_eq!(snap.retry_count, 0);
                reconnected = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reconnected, "session never completed a reconnect cycle");

    let snap = h.manager.get_stats(&session_id).unwrap();
    assert!(snap.last_disconnect_at.is_some());
    assert!(snap.last_error.is_some());
    assert!(*snap.messages_per_ticker.get("BBCA").unwrap_or(&0) >= 1);
    assert!(*snap.messages_per_ticker.get("TLKM").unwrap_or(&0) >= 1);

    // One row per ticker landed in that day's orderbook file.
    let date: NaiveDate = "2025-11-03".parse().unwrap();
    for ticker in ["BBCA", "TLKM"] {
        let path = h.sink.file_path(Dataset::Orderbook, ticker, date);
        let content = std::fs::read_to_string(&path)
            .unwrap_or_else(|_| panic!("missing csv for {}", ticker));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "timestamp,price,lots,total_value,side");
        assert!(lines.len() >= 2);
        assert!(lines[1].starts_with(SERVER_TS));
        assert!(lines[1].ends_with(",BID"));
    }

    h.manager.stop_stream(&session_id).unwrap();
    h.manager.stop_all().await;

    let snap = h.manager.get_stats(&session_id).unwrap();
    assert_eq!(snap.state, SessionState::Stopped);
}

#[tokio::test]
async fn test_subscription_bytes_match_codec_output() {
    let h = harness().await;

    let session_id = h
        .manager
        .start_stream(None, vec!["BBCA".to_string()], None)
        .unwrap();

    // Wait for the broker to record a subscription.
    for _ in 0..300 {
        if !h.subscriptions.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let received = h.subscriptions.lock().first().cloned();
    let received = received.expect("broker never received a subscription");

    // The frame on the wire is byte-identical to the codec's own output for
    // this (user_id, tickers, key, token) tuple. The test token carries no
    // user-id claim, so the session falls back to user id 0.
    let expected = wire::encode_subscribe(0, &["BBCA".to_string()], TRADING_KEY, TOKEN);
    assert_eq!(received, expected);

    let decoded = wire::decode_subscribe(&received).unwrap();
    assert_eq!(decoded.channels, vec!["BBCA", "2BBCA", ":BBCA", "JBBCA"]);
    assert_eq!(decoded.trading_key, TRADING_KEY);
    assert_eq!(decoded.token, TOKEN);

    h.manager.stop_stream(&session_id).unwrap();
    h.manager.stop_all().await;
}
