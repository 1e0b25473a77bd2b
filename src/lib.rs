//! Stockbit market data ingestor.
//!
//! Two acquisition paths share one CSV sink: a durable job scheduler that
//! paginates the historical running-trade endpoint, and long-lived
//! WebSocket sessions decoding the binary orderbook feed. Everything is
//! driven through the typed [`facade::IngestHub`].

pub mod auth;
pub mod backoff;
pub mod config;
pub mod error;
pub mod facade;
pub mod jobs;
pub mod logbuf;
pub mod rest;
pub mod sink;
pub mod stream;
pub mod wire;

pub use config::IngestConfig;
pub use error::{IngestError, IngestResult};
pub use facade::IngestHub;
