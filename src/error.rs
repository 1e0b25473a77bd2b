//! Error taxonomy for the ingest pipeline.
//!
//! Four propagation kinds cover every fallible core path. Callers match
//! exhaustively and decide the recovery policy themselves:
//! - `AuthExpired` pauses the affected job / retries the affected session,
//!   never silently retried.
//! - `Retryable` is recovered locally with bounded exponential backoff.
//! - `Malformed` drops the offending page/frame and keeps going.
//! - `Fatal` stops the owning worker.

use std::fmt;

/// Sum-typed ingest error. The variant is the recovery policy.
#[derive(Debug, Clone)]
pub enum IngestError {
    /// Credential rejected by the broker (HTTP 401/403, expired bearer).
    AuthExpired(String),
    /// Transient failure: network error, timeout, 429, 5xx, unclean WS close.
    Retryable(String),
    /// Decode failure or schema mismatch in a response or frame.
    Malformed(String),
    /// Unrecoverable for the owning worker: disk full, DB unavailable.
    Fatal(String),
}

impl IngestError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::AuthExpired(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// True for failures worth a local backoff-and-retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    /// Short stable tag for logs and status snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthExpired(_) => "auth_expired",
            Self::Retryable(_) => "retryable",
            Self::Malformed(_) => "malformed",
            Self::Fatal(_) => "fatal",
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthExpired(msg) => write!(f, "auth expired: {}", msg),
            Self::Retryable(msg) => write!(f, "retryable: {}", msg),
            Self::Malformed(msg) => write!(f, "malformed: {}", msg),
            Self::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        Self::Fatal(e.to_string())
    }
}

pub type IngestResult<T> = Result<T, IngestError>;
