//! Durable session publication.
//!
//! A verified session is encoded into a single cookie-equivalent record keyed
//! by a deterministic name derived from the backend project identifier, so
//! non-interactive server-rendered requests can read the same session without
//! an interactive round trip. Publication overwrites in place; there is never
//! more than one record per project ref.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue},
};
use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::config::FlowConfig;
use crate::provider::{IdentityProvider, Session};

/// The single mutable slot holding encoded session records, keyed by name.
///
/// Implementations back this with whatever the embedding surface offers
/// (a cookie jar, local storage, an in-process map). `put` must overwrite.
pub trait SessionStore: Send + Sync {
    fn put(&self, name: &str, value: &str, max_age: Option<i64>);
    fn get(&self, name: &str) -> Option<String>;
    fn remove(&self, name: &str);
}

/// In-process store used by tests and embedders without a cookie surface.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn put(&self, name: &str, value: &str, _max_age: Option<i64>) {
        self.records
            .lock()
            .expect("session store lock poisoned")
            .insert(name.to_string(), value.to_string());
    }

    fn get(&self, name: &str) -> Option<String> {
        self.records
            .lock()
            .expect("session store lock poisoned")
            .get(name)
            .cloned()
    }

    fn remove(&self, name: &str) {
        self.records
            .lock()
            .expect("session store lock poisoned")
            .remove(name);
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("published session was not retrievable through the read path")]
    Unconfirmed,
}

/// Deterministic record name for a backend project identifier.
#[must_use]
pub fn record_name(project_ref: &str) -> String {
    format!("{project_ref}-auth-token")
}

/// Canonical encoded form: JSON of the session, base64url without padding.
pub fn encode_session(session: &Session) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(session)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

/// Decode a record produced by [`encode_session`]. Unreadable records are
/// treated as absent rather than errors.
#[must_use]
pub fn decode_session(value: &str) -> Option<Session> {
    let bytes = Base64UrlUnpadded::decode_vec(value).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Seconds until the session expires, for mirroring into the record's Max-Age.
/// `None` means the session has no explicit expiry.
fn remaining_seconds(session: &Session) -> Option<i64> {
    session
        .expires_at
        .map(|at| (at - Utc::now()).num_seconds().max(0))
}

pub struct SessionSynchronizer {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn IdentityProvider>,
    record_name: String,
    confirm_retry_delay: std::time::Duration,
    secure_cookies: bool,
}

impl SessionSynchronizer {
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn IdentityProvider>,
        config: &FlowConfig,
    ) -> Self {
        Self {
            store,
            provider,
            record_name: record_name(config.project_ref()),
            confirm_retry_delay: config.confirm_retry_delay(),
            secure_cookies: config.secure_cookies(),
        }
    }

    #[must_use]
    pub fn record_name(&self) -> &str {
        &self.record_name
    }

    /// Publish the session into the durable slot, overwriting any previous
    /// record, then confirm it is independently retrievable. One retry after
    /// a fixed delay; a second failure is reported to the caller.
    ///
    /// # Errors
    /// Returns [`PublishError`] when encoding fails or confirmation does not
    /// succeed within the retry budget.
    #[instrument(skip(self, session), fields(record = %self.record_name))]
    pub async fn publish(&self, session: &Session) -> Result<(), PublishError> {
        let encoded = encode_session(session)?;
        let max_age = remaining_seconds(session);
        self.store.put(&self.record_name, &encoded, max_age);
        if self.confirm(session).await {
            return Ok(());
        }
        warn!("Publish confirmation failed, retrying once");
        sleep(self.confirm_retry_delay).await;
        self.store.put(&self.record_name, &encoded, max_age);
        if self.confirm(session).await {
            return Ok(());
        }
        Err(PublishError::Unconfirmed)
    }

    async fn confirm(&self, expected: &Session) -> bool {
        // The record must decode back and the backend read path must agree on
        // the session owner.
        let stored = self
            .store
            .get(&self.record_name)
            .and_then(|value| decode_session(&value));
        if stored.as_ref().map(|session| session.user_id) != Some(expected.user_id) {
            return false;
        }
        match self.provider.get_session().await {
            Ok(Some(live)) => live.user_id == expected.user_id,
            Ok(None) => false,
            Err(err) => {
                debug!("Session read path unavailable during confirm: {err}");
                false
            }
        }
    }

    /// Read path used by the orchestrator and by server-side callers sharing
    /// the same store.
    #[must_use]
    pub fn load(&self) -> Option<Session> {
        self.store
            .get(&self.record_name)
            .and_then(|value| decode_session(&value))
    }

    /// Clear the durable slot. Called on sign-out and before a new identity
    /// verification begins, so a previous identity can never bleed through.
    pub fn clear(&self) {
        self.store.remove(&self.record_name);
    }

    /// Build the `Set-Cookie` value for the published record.
    ///
    /// # Errors
    /// Returns an error when the encoded record is not a valid header value.
    pub fn cookie_header(&self, session: &Session) -> Result<HeaderValue, CookieError> {
        let encoded = encode_session(session)?;
        let mut cookie = format!(
            "{}={encoded}; Path=/; HttpOnly; SameSite=Lax",
            self.record_name
        );
        if let Some(max_age) = remaining_seconds(session) {
            cookie.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        Ok(HeaderValue::from_str(&cookie)?)
    }
}

#[derive(Debug, Error)]
pub enum CookieError {
    #[error("failed to encode session record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session record is not a valid header value")]
    Header(#[from] InvalidHeaderValue),
}

/// Read the published session out of request cookies without running the
/// orchestrator. Missing or undecodable cookies read as "no session".
#[must_use]
pub fn read_from_headers(headers: &HeaderMap, project_ref: &str) -> Option<Session> {
    let wanted = record_name(project_ref);
    let header = headers.get(COOKIE)?;
    let value = header.to_str().ok()?;
    for pair in value.split(';') {
        let trimmed = pair.trim();
        let mut parts = trimmed.splitn(2, '=');
        let key = parts.next()?.trim();
        let val = parts.next()?.trim();
        if key == wanted {
            return decode_session(val);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        BackendError, CodeKind, CreateOutcome, PasswordError, SendError, VerifyError,
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;
    use uuid::Uuid;

    /// Provider fake whose read path can be made to fail the first N reads.
    struct FlakyReads {
        session: Session,
        failures_left: AtomicUsize,
        reads: AtomicUsize,
    }

    impl FlakyReads {
        fn new(session: Session, failures: usize) -> Self {
            Self {
                session,
                failures_left: AtomicUsize::new(failures),
                reads: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for FlakyReads {
        async fn send_code_or_link(&self, _: &str, _: Option<&Url>) -> Result<(), SendError> {
            Ok(())
        }

        async fn verify_code(
            &self,
            _: &str,
            _: &str,
            _: CodeKind,
        ) -> Result<Session, VerifyError> {
            Err(VerifyError::Invalid)
        }

        async fn sign_in_password(
            &self,
            _: &str,
            _: &SecretString,
        ) -> Result<Session, PasswordError> {
            Err(PasswordError::BadCredentials)
        }

        async fn create_account_password(
            &self,
            _: &str,
            _: &SecretString,
        ) -> Result<CreateOutcome, PasswordError> {
            Ok(CreateOutcome::Created)
        }

        async fn get_session(&self) -> Result<Option<Session>, BackendError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Ok(None);
            }
            Ok(Some(self.session.clone()))
        }
    }

    fn session() -> Session {
        Session {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            user_id: Uuid::new_v4(),
        }
    }

    fn synchronizer(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<MemorySessionStore>,
    ) -> SessionSynchronizer {
        let config = FlowConfig::new("evt01".to_string())
            .with_confirm_retry_delay(Duration::from_millis(1));
        SessionSynchronizer::new(store, provider, &config)
    }

    #[test]
    fn record_name_is_deterministic() {
        assert_eq!(record_name("evt01"), "evt01-auth-token");
        assert_eq!(record_name("evt01"), record_name("evt01"));
    }

    #[test]
    fn encode_decode_round_trip() -> Result<()> {
        let session = session();
        let encoded = encode_session(&session)?;
        assert_eq!(decode_session(&encoded), Some(session));
        Ok(())
    }

    #[test]
    fn undecodable_record_reads_as_absent() {
        assert_eq!(decode_session("not-base64!"), None);
        let garbage = Base64UrlUnpadded::encode_string(b"not json");
        assert_eq!(decode_session(&garbage), None);
    }

    #[tokio::test]
    async fn publish_twice_leaves_one_identical_record() -> Result<()> {
        let session = session();
        let store = Arc::new(MemorySessionStore::new());
        let provider = Arc::new(FlakyReads::new(session.clone(), 0));
        let sync = synchronizer(provider, store.clone());

        sync.publish(&session).await?;
        let first = store.get(sync.record_name()).expect("record missing");
        sync.publish(&session).await?;
        let second = store.get(sync.record_name()).expect("record missing");

        assert_eq!(first, second);
        assert_eq!(store.records.lock().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn publish_retries_once_then_succeeds() -> Result<()> {
        let session = session();
        let store = Arc::new(MemorySessionStore::new());
        let provider = Arc::new(FlakyReads::new(session.clone(), 1));
        let sync = synchronizer(provider.clone(), store);

        sync.publish(&session).await?;
        assert_eq!(provider.reads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn publish_gives_up_after_one_retry() {
        let session = session();
        let store = Arc::new(MemorySessionStore::new());
        let provider = Arc::new(FlakyReads::new(session.clone(), 5));
        let sync = synchronizer(provider.clone(), store);

        let err = sync.publish(&session).await.unwrap_err();
        assert!(matches!(err, PublishError::Unconfirmed));
        assert_eq!(provider.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_then_load_reads_nothing() -> Result<()> {
        let session = session();
        let store = Arc::new(MemorySessionStore::new());
        let provider = Arc::new(FlakyReads::new(session.clone(), 0));
        let sync = synchronizer(provider, store);

        sync.publish(&session).await?;
        assert_eq!(sync.load(), Some(session));
        sync.clear();
        assert_eq!(sync.load(), None);
        Ok(())
    }

    #[tokio::test]
    async fn cookie_mirrors_expiry_and_omits_it_when_absent() -> Result<()> {
        let store = Arc::new(MemorySessionStore::new());
        let mut session = session();
        let provider = Arc::new(FlakyReads::new(session.clone(), 0));
        let sync = synchronizer(provider, store);

        let cookie = sync.cookie_header(&session)?;
        let cookie = cookie.to_str()?;
        assert!(cookie.starts_with("evt01-auth-token="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Max-Age="));
        assert!(cookie.contains("Secure"));

        session.expires_at = None;
        let open_ended = sync.cookie_header(&session)?;
        assert!(!open_ended.to_str()?.contains("Max-Age="));
        Ok(())
    }

    #[test]
    fn read_from_headers_finds_the_record() -> Result<()> {
        let session = session();
        let encoded = encode_session(&session)?;
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!(
                "other=1; evt01-auth-token={encoded}; theme=dark"
            ))?,
        );
        assert_eq!(read_from_headers(&headers, "evt01"), Some(session));
        assert_eq!(read_from_headers(&headers, "evt02"), None);
        assert_eq!(read_from_headers(&HeaderMap::new(), "evt01"), None);
        Ok(())
    }
}
