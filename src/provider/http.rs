//! HTTP client for a passwordless+password identity backend.
//!
//! Endpoint shape follows the conventional passwordless provider layout:
//! `/otp` issues codes and links, `/verify` exchanges a code under a type tag,
//! `/token?grant_type=password` and `/signup` cover the password path. Error
//! bodies carry an `error_code` field which is mapped onto the closed error
//! enums in [`super`]; anything unrecognized degrades to `Backend`.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use super::{
    BackendError, CodeKind, CreateOutcome, IdentityProvider, PasswordError, SendError, Session,
    VerifyError,
};

/// Identity backend client holding the current session slot.
///
/// The slot mirrors what a browser-held client would keep in memory: it is
/// replaced on every successful verification and consulted by the
/// synchronizer's publish confirmation.
pub struct HttpIdentityProvider {
    client: Client,
    base: Url,
    api_key: SecretString,
    current: RwLock<Option<Session>>,
}

impl HttpIdentityProvider {
    /// # Errors
    /// Returns an error if the base URL does not parse or the client cannot be built.
    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)?;
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base,
            api_key,
            current: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base.join(path)
    }

    async fn post_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: Value,
    ) -> Result<(StatusCode, Value), String> {
        let url = self.endpoint(path).map_err(|err| err.to_string())?;
        let response = self
            .client
            .post(url)
            .query(query)
            .header("apikey", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        // Empty bodies (204-style responses) decode as null.
        let value = response.json::<Value>().await.unwrap_or(Value::Null);
        debug!("identity backend {path} returned {status}");
        Ok((status, value))
    }

    async fn remember(&self, session: &Session) {
        let mut slot = self.current.write().await;
        *slot = Some(session.clone());
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[instrument(skip(self))]
    async fn send_code_or_link(
        &self,
        email: &str,
        redirect_target: Option<&Url>,
    ) -> Result<(), SendError> {
        let mut body = json!({ "email": email, "create_user": true });
        if let Some(target) = redirect_target {
            body["redirect_to"] = Value::String(target.to_string());
        }
        let (status, value) = self
            .post_json("otp", &[], body)
            .await
            .map_err(SendError::Backend)?;
        if status.is_success() {
            return Ok(());
        }
        Err(classify_send(status, &value))
    }

    #[instrument(skip(self, code), fields(tag = kind.as_str()))]
    async fn verify_code(
        &self,
        email: &str,
        code: &str,
        kind: CodeKind,
    ) -> Result<Session, VerifyError> {
        let body = json!({ "type": kind.as_str(), "email": email, "token": code });
        let (status, value) = self
            .post_json("verify", &[], body)
            .await
            .map_err(VerifyError::Backend)?;
        if status.is_success() {
            let session = parse_session(&value).map_err(VerifyError::Backend)?;
            self.remember(&session).await;
            return Ok(session);
        }
        Err(classify_verify(status, &value))
    }

    #[instrument(skip(self, secret))]
    async fn sign_in_password(
        &self,
        email: &str,
        secret: &SecretString,
    ) -> Result<Session, PasswordError> {
        let body = json!({ "email": email, "password": secret.expose_secret() });
        let (status, value) = self
            .post_json("token", &[("grant_type", "password")], body)
            .await
            .map_err(PasswordError::Backend)?;
        if status.is_success() {
            let session = parse_session(&value).map_err(PasswordError::Backend)?;
            self.remember(&session).await;
            return Ok(session);
        }
        Err(classify_password(status, &value))
    }

    #[instrument(skip(self, secret))]
    async fn create_account_password(
        &self,
        email: &str,
        secret: &SecretString,
    ) -> Result<CreateOutcome, PasswordError> {
        let body = json!({ "email": email, "password": secret.expose_secret() });
        let (status, value) = self
            .post_json("signup", &[], body)
            .await
            .map_err(PasswordError::Backend)?;
        if status.is_success() {
            return Ok(CreateOutcome::Created);
        }
        if error_code(&value) == Some("user_already_exists") || status == StatusCode::CONFLICT {
            return Ok(CreateOutcome::AlreadyExists);
        }
        Err(classify_password(status, &value))
    }

    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let slot = self.current.read().await;
        let live = slot.as_ref().filter(|session| {
            session
                .expires_at
                .is_none_or(|expires_at| expires_at > Utc::now())
        });
        Ok(live.cloned())
    }
}

/// Pull the machine-readable error code from a backend error body.
fn error_code(body: &Value) -> Option<&str> {
    body.get("error_code")
        .or_else(|| body.get("error"))
        .and_then(Value::as_str)
}

fn error_message(body: &Value) -> String {
    body.get("msg")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string()
}

fn classify_send(status: StatusCode, body: &Value) -> SendError {
    if status == StatusCode::TOO_MANY_REQUESTS || error_code(body) == Some("over_email_send_rate_limit")
    {
        return SendError::RateLimited;
    }
    match error_code(body) {
        Some("signup_disabled" | "otp_disabled") => SendError::Disabled,
        _ => SendError::Backend(error_message(body)),
    }
}

fn classify_verify(status: StatusCode, body: &Value) -> VerifyError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return VerifyError::RateLimited;
    }
    match error_code(body) {
        Some("otp_expired") => VerifyError::Expired,
        Some("user_not_found") => VerifyError::NotFound,
        _ if status == StatusCode::NOT_FOUND => VerifyError::NotFound,
        _ if status.is_client_error() => VerifyError::Invalid,
        _ => VerifyError::Backend(error_message(body)),
    }
}

fn classify_password(status: StatusCode, body: &Value) -> PasswordError {
    match error_code(body) {
        Some("invalid_credentials" | "invalid_grant") => PasswordError::BadCredentials,
        Some("user_not_found") => PasswordError::NotFound,
        _ if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED => {
            PasswordError::BadCredentials
        }
        _ if status == StatusCode::NOT_FOUND => PasswordError::NotFound,
        _ => PasswordError::Backend(error_message(body)),
    }
}

/// Decode a session payload: tokens, owning user id, optional expiry.
fn parse_session(value: &Value) -> Result<Session, String> {
    let access_token = value
        .get("access_token")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing access_token".to_string())?
        .to_string();
    let refresh_token = value
        .get("refresh_token")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing refresh_token".to_string())?
        .to_string();
    let user_id = value
        .get("user")
        .and_then(|user| user.get("id"))
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| "missing user id".to_string())?;
    // Prefer the absolute expiry; fall back to a relative one; accept neither.
    let expires_at: Option<DateTime<Utc>> = value
        .get("expires_at")
        .and_then(Value::as_i64)
        .and_then(|unix| Utc.timestamp_opt(unix, 0).single())
        .or_else(|| {
            value
                .get("expires_in")
                .and_then(Value::as_i64)
                .map(|seconds| Utc::now() + chrono::Duration::seconds(seconds))
        });
    Ok(Session {
        access_token,
        refresh_token,
        expires_at,
        user_id,
    })
}
