//! Identity-provider collaborator interface.
//!
//! The backend that issues one-time codes and links, checks passwords, and
//! mints sessions is an external system. Everything in this crate talks to it
//! through [`IdentityProvider`], so tests can swap in fakes and embedders can
//! plug their own transport. [`http::HttpIdentityProvider`] is the shipped
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub mod http;

/// Backend-recognized code type tags.
///
/// The issuing side does not report which tag it used, so verification walks
/// [`CodeKind::VERIFY_ORDER`] and stops at the first success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Email,
    Signup,
    MagicLink,
}

impl CodeKind {
    /// Fixed verification order: generic email code, signup code, link code.
    pub const VERIFY_ORDER: [CodeKind; 3] = [CodeKind::Email, CodeKind::Signup, CodeKind::MagicLink];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CodeKind::Email => "email",
            CodeKind::Signup => "signup",
            CodeKind::MagicLink => "magiclink",
        }
    }
}

/// A verified session minted by the identity backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// `None` means the backend issued no explicit expiry.
    pub expires_at: Option<DateTime<Utc>>,
    pub user_id: Uuid,
}

/// Outcome of a password account creation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("too many send requests")]
    RateLimited,
    #[error("sign-ups are disabled")]
    Disabled,
    #[error("identity backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("code expired")]
    Expired,
    #[error("code invalid")]
    Invalid,
    #[error("account not found")]
    NotFound,
    #[error("too many verification attempts")]
    RateLimited,
    #[error("identity backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("wrong email or password")]
    BadCredentials,
    #[error("account not found")]
    NotFound,
    #[error("identity backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
#[error("identity backend error: {0}")]
pub struct BackendError(pub String);

/// The identity backend consumed by the broker and synchronizer.
///
/// Implementations must be safe to share across tasks; every method is one
/// bounded network round trip from the caller's perspective.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Ask the backend to deliver a one-time code / clickable link.
    async fn send_code_or_link(
        &self,
        email: &str,
        redirect_target: Option<&Url>,
    ) -> Result<(), SendError>;

    /// Exchange a one-time code for a session under one type tag.
    async fn verify_code(
        &self,
        email: &str,
        code: &str,
        kind: CodeKind,
    ) -> Result<Session, VerifyError>;

    /// Classic password sign-in.
    async fn sign_in_password(
        &self,
        email: &str,
        secret: &SecretString,
    ) -> Result<Session, PasswordError>;

    /// First-time password account creation.
    async fn create_account_password(
        &self,
        email: &str,
        secret: &SecretString,
    ) -> Result<CreateOutcome, PasswordError>;

    /// Read path: the session the backend currently considers live, if any.
    /// Used by the synchronizer to confirm a publish.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;
}
