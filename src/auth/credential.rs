//! Bearer token + session cookie store with on-disk persistence.
//!
//! The on-disk format is a single JSON blob:
//!
//! ```json
//! { "access_token": "...", "cookies": null, "expires_at": null, "user_id": null }
//! ```
//!
//! Writes are atomic (temp file + rename) so a crash mid-save never leaves a
//! half-written credential. A malformed token is NOT rejected: it is stored
//! opaquely and validity becomes "unknown".

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Tokens within this margin of expiry are already treated as invalid, so a
/// request started "just in time" does not arrive expired.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// On-disk credential blob. Field set and names are fixed; a credential
/// written to disk round-trips identically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredCredential {
    pub access_token: String,
    pub cookies: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
}

/// Remaining token lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenExpiry {
    /// Token present but carries no readable expiry claim.
    Unknown,
    /// Best-known expiry has passed.
    Expired,
    /// Time left until best-known expiry.
    Remaining(Duration),
}

/// Read-only snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub present: bool,
    pub valid: bool,
    pub user_id: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in_secs: Option<i64>,
}

/// Process-wide credential store. Many concurrent readers, one mutator at a
/// time; `set`/`clear` persist before returning.
pub struct CredentialStore {
    path: PathBuf,
    inner: RwLock<Option<StoredCredential>>,
}

impl CredentialStore {
    /// Open the store, lazily loading any previously persisted credential.
    /// A present-but-unreadable file is logged and ignored.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let loaded = Self::load_file(&path);

        if loaded.is_some() {
            info!(path = %path.display(), "loaded persisted credential");
        }

        Self {
            path,
            inner: RwLock::new(loaded),
        }
    }

    fn load_file(path: &Path) -> Option<StoredCredential> {
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<StoredCredential>(&content) {
                Ok(cred) if !cred.access_token.is_empty() => Some(cred),
                Ok(_) => None,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "credential file unreadable, ignoring");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read credential file");
                None
            }
        }
    }

    /// Replace the current credential and persist it. Claims are extracted
    /// best-effort; a token whose payload cannot be parsed is kept with
    /// unknown expiry. An empty token is stored as "none".
    pub fn set(&self, token: &str, cookies: Option<&str>) -> Result<()> {
        if token.trim().is_empty() {
            info!("empty token supplied, clearing credential");
            return self.clear();
        }

        let (expires_at, user_id) = match extract_claims(token) {
            Some(claims) => claims,
            None => {
                debug!("token claims unreadable, storing opaquely");
                (None, None)
            }
        };

        let cred = StoredCredential {
            access_token: token.to_string(),
            cookies: cookies.map(|c| c.to_string()).filter(|c| !c.is_empty()),
            expires_at,
            user_id,
        };

        self.persist(&cred)?;
        *self.inner.write() = Some(cred);

        info!(
            user_id = ?user_id,
            expires_at = ?expires_at,
            "credential set"
        );
        Ok(())
    }

    /// Current bearer token, if any.
    pub fn get_token(&self) -> Option<String> {
        self.inner.read().as_ref().map(|c| c.access_token.clone())
    }

    /// Cookie string for request headers, if set.
    pub fn cookie_header(&self) -> Option<String> {
        self.inner.read().as_ref().and_then(|c| c.cookies.clone())
    }

    /// User id extracted from the token claims, if readable.
    pub fn user_id(&self) -> Option<i64> {
        self.inner.read().as_ref().and_then(|c| c.user_id)
    }

    /// True iff a token is present and not past its best-known expiry minus
    /// a safety margin. Unknown expiry counts as valid.
    pub fn is_valid(&self) -> bool {
        match self.time_until_expiry() {
            None | Some(TokenExpiry::Expired) => false,
            Some(TokenExpiry::Unknown) => true,
            Some(TokenExpiry::Remaining(_)) => true,
        }
    }

    /// Remaining lifetime; `None` when no credential is stored.
    pub fn time_until_expiry(&self) -> Option<TokenExpiry> {
        let guard = self.inner.read();
        let cred = guard.as_ref()?;

        let expires_at = match cred.expires_at {
            Some(t) => t,
            None => return Some(TokenExpiry::Unknown),
        };

        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining <= EXPIRY_SAFETY_MARGIN {
            Some(TokenExpiry::Expired)
        } else {
            Some(TokenExpiry::Remaining(remaining - EXPIRY_SAFETY_MARGIN))
        }
    }

    /// Drop the credential and remove the persisted file.
    pub fn clear(&self) -> Result<()> {
        *self.inner.write() = None;
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove {}", self.path.display()))?;
        }
        info!("credential cleared");
        Ok(())
    }

    /// Status snapshot for the control surface.
    pub fn status(&self) -> CredentialStatus {
        let (present, user_id, expires_at) = {
            let guard = self.inner.read();
            match guard.as_ref() {
                Some(c) => (true, c.user_id, c.expires_at),
                None => (false, None, None),
            }
        };

        CredentialStatus {
            present,
            valid: present && self.is_valid(),
            user_id,
            expires_at,
            expires_in_secs: expires_at.map(|t| (t - Utc::now()).num_seconds()),
        }
    }

    fn persist(&self, cred: &StoredCredential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let content = serde_json::to_string_pretty(cred).context("failed to serialize credential")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Best-effort claim extraction: base64url-decode the JWT payload segment
/// and pull `exp` plus a user-id claim. No signature verification; any
/// failure yields `None` and the token is stored opaquely.
fn extract_claims(token: &str) -> Option<(Option<DateTime<Utc>>, Option<i64>)> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;

    let expires_at = claims
        .get("exp")
        .and_then(|v| v.as_i64())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    let user_id = ["user_id", "userId", "uid", "sub"]
        .iter()
        .find_map(|key| {
            let v = claims.get(*key)?;
            v.as_i64().or_else(|| v.as_str()?.parse().ok())
        });

    Some((expires_at, user_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Unsigned JWT with the given JSON claims (header and signature are
    /// irrelevant to best-effort extraction).
    fn fake_jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::open(dir.path().join("token.json"))
    }

    #[test]
    fn test_set_extracts_claims() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let exp = Utc::now().timestamp() + 7200;
        let token = fake_jwt(serde_json::json!({ "exp": exp, "user_id": 4826457 }));
        store.set(&token, Some("sid=abc")).unwrap();

        assert_eq!(store.user_id(), Some(4826457));
        assert_eq!(store.cookie_header().as_deref(), Some("sid=abc"));
        assert!(store.is_valid());
        assert!(matches!(
            store.time_until_expiry(),
            Some(TokenExpiry::Remaining(_))
        ));
    }

    #[test]
    fn test_roundtrip_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");

        let exp = Utc::now().timestamp() + 7200;
        let token = fake_jwt(serde_json::json!({ "exp": exp, "userId": 7 }));
        {
            let store = CredentialStore::open(&path);
            store.set(&token, None).unwrap();
        }

        let written: StoredCredential =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        let reopened = CredentialStore::open(&path);
        assert_eq!(reopened.get_token().as_deref(), Some(token.as_str()));
        assert_eq!(reopened.user_id(), Some(7));
        assert_eq!(
            written,
            StoredCredential {
                access_token: token,
                cookies: None,
                expires_at: written.expires_at,
                user_id: Some(7),
            }
        );
    }

    #[test]
    fn test_malformed_token_stored_opaquely() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        store.set("not-a-jwt", None).unwrap();
        assert_eq!(store.get_token().as_deref(), Some("not-a-jwt"));
        assert_eq!(store.time_until_expiry(), Some(TokenExpiry::Unknown));
        // Unknown expiry still counts as usable.
        assert!(store.is_valid());
    }

    #[test]
    fn test_empty_token_is_none() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        store.set("  ", None).unwrap();
        assert_eq!(store.get_token(), None);
        assert!(!store.is_valid());
        assert!(store.time_until_expiry().is_none());
    }

    #[test]
    fn test_expired_token_invalid() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let exp = Utc::now().timestamp() - 10;
        store
            .set(&fake_jwt(serde_json::json!({ "exp": exp })), None)
            .unwrap();

        assert!(!store.is_valid());
        assert_eq!(store.time_until_expiry(), Some(TokenExpiry::Expired));
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = CredentialStore::open(&path);

        store.set("tok", None).unwrap();
        assert!(path.exists());

        store.clear().unwrap();
        assert!(!path.exists());
        assert!(store.get_token().is_none());
    }

    #[test]
    fn test_status_snapshot() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);

        let status = store.status();
        assert!(!status.present);
        assert!(!status.valid);

        let exp = Utc::now().timestamp() + 7200;
        store
            .set(&fake_jwt(serde_json::json!({ "exp": exp, "uid": 3 })), None)
            .unwrap();

        let status = store.status();
        assert!(status.present);
        assert!(status.valid);
        assert_eq!(status.user_id, Some(3));
        assert!(status.expires_in_secs.unwrap() > 7000);
    }
}
