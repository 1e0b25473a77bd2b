//! Credential handling.
//!
//! The broker issues a JWT bearer token (through a login flow that lives
//! outside this crate) plus opaque session cookies. This module stores them,
//! answers validity queries, and persists them across restarts. Tokens are
//! never verified locally; claims are only inspected for expiry and user id.

mod credential;

pub use credential::{CredentialStatus, CredentialStore, StoredCredential, TokenExpiry};

use async_trait::async_trait;

use crate::error::IngestResult;

/// Hook invoked before each streaming connect so an externally driven
/// refresh (e.g. an automated login helper) can run first. Failures are
/// non-fatal; the session proceeds with whatever credential is stored.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, store: &CredentialStore) -> IngestResult<()>;
}
