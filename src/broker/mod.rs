//! Credential broker: drives one authentication attempt to a terminal outcome.
//!
//! Three interchangeable strategies prove ownership of an identity claim: an
//! 8-digit one-time code, a clickable link, and a classic password. Every
//! failure is classified into a closed set of reasons; the wizard's state
//! table consumes those reasons, never raw backend errors.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, instrument, warn};
use url::Url;

use crate::config::FlowConfig;
use crate::provider::{
    CodeKind, CreateOutcome, IdentityProvider, PasswordError, SendError, Session, VerifyError,
};
use crate::session_sync::{SessionStore, record_name};

mod continuation;

pub use continuation::{CONTINUATION_NAMESPACE, ContinuationCache};

/// One-time codes are exactly this many digits.
pub const CODE_LEN: usize = 8;

/// Failures the user can correct by trying the same strategy again.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RetryReason {
    #[error("that code has expired, request a new one")]
    CodeExpired,
    #[error("that code is not right")]
    CodeInvalid,
    #[error("enter the full 8-digit code")]
    CodeTooShort,
    #[error("wrong email or password")]
    WrongPassword,
    #[error("password must be at least {min} characters")]
    PasswordTooShort { min: usize },
    #[error("passwords do not match")]
    PasswordMismatch,
    #[error("the request timed out, try again")]
    Timeout,
    #[error("another attempt is already in progress")]
    AttemptPending,
}

/// Failures that should route the user to the password strategy instead of
/// dead-ending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum FallbackReason {
    #[error("too many requests, sign in with a password instead")]
    RateLimited,
    #[error("this link was opened in a different browser")]
    CrossContext,
    #[error("this link has already been used or has expired")]
    LinkConsumed,
}

/// Terminal failures; the flow restarts from identity entry.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum FatalReason {
    #[error("account not found")]
    AccountNotFound,
    #[error("sign-ups are currently disabled")]
    SignupsDisabled,
    #[error("could not sign in after creating the account")]
    RetriesExhausted,
    #[error("identity backend failure: {message}")]
    Backend { message: String },
}

/// Terminal result of one verification attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Verified(Session),
    Retry(RetryReason),
    Fallback(FallbackReason),
    Fatal(FatalReason),
}

/// Result of requesting a code/link send.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Retry(RetryReason),
    Fallback(FallbackReason),
    Fatal(FatalReason),
}

/// Keep digits only, capped at the code length.
#[must_use]
pub fn sanitize_code(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_digit)
        .take(CODE_LEN)
        .collect()
}

/// Normalize an email claim for lookups and cache keys.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
#[must_use]
pub fn valid_email(email_normalized: &str) -> bool {
    regex::Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Releases the per-claim pending-attempt slot on drop.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CredentialBroker {
    provider: Arc<dyn IdentityProvider>,
    continuations: Arc<ContinuationCache>,
    session_slot: Arc<dyn SessionStore>,
    session_record: String,
    call_timeout: Duration,
    retry_backoff: Vec<Duration>,
    min_password_len: usize,
    in_flight: AtomicBool,
}

impl CredentialBroker {
    #[must_use]
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        continuations: Arc<ContinuationCache>,
        session_slot: Arc<dyn SessionStore>,
        config: &FlowConfig,
    ) -> Self {
        Self {
            provider,
            continuations,
            session_slot,
            session_record: record_name(config.project_ref()),
            call_timeout: config.call_timeout(),
            retry_backoff: config.password_retry_backoff().to_vec(),
            min_password_len: config.min_password_len(),
            in_flight: AtomicBool::new(false),
        }
    }

    /// At most one attempt may be pending per identity claim.
    fn acquire(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InFlightGuard(&self.in_flight))
    }

    /// Ask the backend to deliver a one-time code / clickable link.
    ///
    /// Any previously cached continuation secret and any existing session
    /// record are cleared first, so a different identity signing in within
    /// the same browser cannot inherit stale state.
    #[instrument(skip(self), fields(strategy = "code"))]
    pub async fn request_code(
        &self,
        email: &str,
        redirect_target: Option<&Url>,
    ) -> SendOutcome {
        self.continuations.clear();
        self.session_slot.remove(&self.session_record);
        let send = self.provider.send_code_or_link(email, redirect_target);
        match timeout(self.call_timeout, send).await {
            Err(_) => {
                warn!("Code send timed out");
                SendOutcome::Retry(RetryReason::Timeout)
            }
            Ok(Ok(())) => {
                if let Err(err) = self.continuations.issue(email) {
                    // The code path still works; only same-browser link
                    // continuation is lost.
                    warn!("Failed to cache continuation secret: {err}");
                }
                SendOutcome::Sent
            }
            Ok(Err(SendError::RateLimited)) => {
                warn!("Link issuance rate limited");
                SendOutcome::Fallback(FallbackReason::RateLimited)
            }
            Ok(Err(SendError::Disabled)) => SendOutcome::Fatal(FatalReason::SignupsDisabled),
            Ok(Err(SendError::Backend(message))) => {
                error!("Code send failed: {message}");
                SendOutcome::Fatal(FatalReason::Backend { message })
            }
        }
    }

    /// Verify a one-time code, walking the backend type tags in fixed order.
    ///
    /// The issuing side does not say which tag it used, so each tag is tried
    /// sequentially and the walk stops at the first success. "Not found" and
    /// rate limiting stop the walk immediately; other failures move on to the
    /// next tag. Codes are single-use, which is why the walk is never
    /// parallelized.
    #[instrument(skip(self, input), fields(strategy = "code"))]
    pub async fn verify_code(&self, email: &str, input: &str) -> Outcome {
        let Some(_guard) = self.acquire() else {
            return Outcome::Retry(RetryReason::AttemptPending);
        };
        let code = sanitize_code(input);
        if code.len() != CODE_LEN {
            // Rejected locally, no backend call.
            return Outcome::Retry(RetryReason::CodeTooShort);
        }
        let mut saw_expired = false;
        let mut saw_invalid = false;
        let mut last_backend = None;
        for kind in CodeKind::VERIFY_ORDER {
            let verify = self.provider.verify_code(email, &code, kind);
            match timeout(self.call_timeout, verify).await {
                Err(_) => {
                    warn!(tag = kind.as_str(), "Verification call timed out");
                    return Outcome::Retry(RetryReason::Timeout);
                }
                Ok(Ok(session)) => {
                    debug!(tag = kind.as_str(), "Code verified");
                    return Outcome::Verified(session);
                }
                Ok(Err(VerifyError::NotFound)) => {
                    warn!(tag = kind.as_str(), "Account not found");
                    return Outcome::Fatal(FatalReason::AccountNotFound);
                }
                Ok(Err(VerifyError::RateLimited)) => {
                    warn!(tag = kind.as_str(), "Verification rate limited");
                    return Outcome::Fallback(FallbackReason::RateLimited);
                }
                Ok(Err(VerifyError::Expired)) => {
                    debug!(tag = kind.as_str(), "Code expired under this tag");
                    saw_expired = true;
                }
                Ok(Err(VerifyError::Invalid)) => {
                    debug!(tag = kind.as_str(), "Code invalid under this tag");
                    saw_invalid = true;
                }
                Ok(Err(VerifyError::Backend(message))) => {
                    error!(tag = kind.as_str(), "Verification failed: {message}");
                    last_backend = Some(message);
                }
            }
        }
        if saw_expired {
            Outcome::Retry(RetryReason::CodeExpired)
        } else if saw_invalid {
            Outcome::Retry(RetryReason::CodeInvalid)
        } else {
            Outcome::Fatal(FatalReason::Backend {
                message: last_backend.unwrap_or_else(|| "all code tags failed".to_string()),
            })
        }
    }

    /// Complete a clickable link opened by the user.
    ///
    /// Requires the continuation secret cached when the link was requested;
    /// a missing secret means the link was opened in a different browser
    /// context and the password path takes over.
    #[instrument(skip(self, link_code), fields(strategy = "link"))]
    pub async fn redeem_link(&self, email: &str, link_code: &str) -> Outcome {
        let Some(_guard) = self.acquire() else {
            return Outcome::Retry(RetryReason::AttemptPending);
        };
        if self.continuations.take(email).is_none() {
            warn!("Link opened without a continuation secret");
            return Outcome::Fallback(FallbackReason::CrossContext);
        }
        let verify = self.provider.verify_code(email, link_code, CodeKind::MagicLink);
        match timeout(self.call_timeout, verify).await {
            Err(_) => {
                warn!("Link exchange timed out");
                Outcome::Retry(RetryReason::Timeout)
            }
            Ok(Ok(session)) => Outcome::Verified(session),
            Ok(Err(VerifyError::Expired | VerifyError::Invalid)) => {
                warn!("Link already consumed or expired");
                Outcome::Fallback(FallbackReason::LinkConsumed)
            }
            Ok(Err(VerifyError::RateLimited)) => Outcome::Fallback(FallbackReason::RateLimited),
            Ok(Err(VerifyError::NotFound)) => Outcome::Fatal(FatalReason::AccountNotFound),
            Ok(Err(VerifyError::Backend(message))) => {
                error!("Link exchange failed: {message}");
                Outcome::Fatal(FatalReason::Backend { message })
            }
        }
    }

    /// Password strategy: sign in, or create the account first when a
    /// confirmation value is supplied.
    ///
    /// After a fresh creation the backend may not have committed the secret
    /// yet, so sign-in is retried with linearly increasing backoff before
    /// declaring failure.
    #[instrument(skip(self, secret, confirm), fields(strategy = "password"))]
    pub async fn password(
        &self,
        email: &str,
        secret: &SecretString,
        confirm: Option<&SecretString>,
    ) -> Outcome {
        let Some(_guard) = self.acquire() else {
            return Outcome::Retry(RetryReason::AttemptPending);
        };
        if secret.expose_secret().len() < self.min_password_len {
            return Outcome::Retry(RetryReason::PasswordTooShort {
                min: self.min_password_len,
            });
        }
        if let Some(confirm) = confirm {
            if confirm.expose_secret() != secret.expose_secret() {
                return Outcome::Retry(RetryReason::PasswordMismatch);
            }
            let create = self.provider.create_account_password(email, secret);
            match timeout(self.call_timeout, create).await {
                Err(_) => {
                    warn!("Account creation timed out");
                    return Outcome::Retry(RetryReason::Timeout);
                }
                Ok(Ok(CreateOutcome::Created)) => {
                    return self.sign_in_with_retries(email, secret).await;
                }
                // An existing account just signs in below.
                Ok(Ok(CreateOutcome::AlreadyExists)) => {}
                Ok(Err(PasswordError::NotFound)) => {
                    return Outcome::Fatal(FatalReason::AccountNotFound);
                }
                Ok(Err(PasswordError::BadCredentials)) => {
                    return Outcome::Retry(RetryReason::WrongPassword);
                }
                Ok(Err(PasswordError::Backend(message))) => {
                    error!("Account creation failed: {message}");
                    return Outcome::Fatal(FatalReason::Backend { message });
                }
            }
        }
        let sign_in = self.provider.sign_in_password(email, secret);
        match timeout(self.call_timeout, sign_in).await {
            Err(_) => {
                warn!("Sign-in timed out");
                Outcome::Retry(RetryReason::Timeout)
            }
            Ok(Ok(session)) => Outcome::Verified(session),
            Ok(Err(PasswordError::BadCredentials)) => Outcome::Retry(RetryReason::WrongPassword),
            Ok(Err(PasswordError::NotFound)) => Outcome::Fatal(FatalReason::AccountNotFound),
            Ok(Err(PasswordError::Backend(message))) => {
                error!("Sign-in failed: {message}");
                Outcome::Fatal(FatalReason::Backend { message })
            }
        }
    }

    async fn sign_in_with_retries(&self, email: &str, secret: &SecretString) -> Outcome {
        let attempts = self.retry_backoff.len() + 1;
        for attempt in 1..=attempts {
            if attempt > 1 {
                let wait = self.retry_backoff[attempt - 2];
                debug!("Backing off {wait:?} before sign-in attempt {attempt}/{attempts}");
                sleep(wait).await;
            }
            let sign_in = self.provider.sign_in_password(email, secret);
            match timeout(self.call_timeout, sign_in).await {
                Err(_) => warn!("Sign-in attempt {attempt} timed out"),
                Ok(Ok(session)) => {
                    debug!("Sign-in succeeded on attempt {attempt}");
                    return Outcome::Verified(session);
                }
                Ok(Err(err)) => debug!("Sign-in attempt {attempt} failed: {err}"),
            }
        }
        error!("Sign-in did not succeed after {attempts} attempts");
        Outcome::Fatal(FatalReason::RetriesExhausted)
    }
}
