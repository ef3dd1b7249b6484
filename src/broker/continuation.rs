//! Continuation secrets for the clickable-link strategy.
//!
//! A link can only be completed in the browser context that requested it; the
//! proof is a one-shot secret cached at request time under an explicit key
//! namespace. Clearing wipes the whole namespace, never individual guesses at
//! key shapes.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{RngCore, rngs::OsRng};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Mutex;

/// Key namespace for continuation secrets.
pub const CONTINUATION_NAMESPACE: &str = "continuation";

fn key_for(email: &str) -> String {
    format!("{CONTINUATION_NAMESPACE}/{email}")
}

/// In-memory, namespaced cache of continuation secrets keyed by identity.
#[derive(Default)]
pub struct ContinuationCache {
    entries: Mutex<HashMap<String, SecretString>>,
}

impl ContinuationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint and cache a fresh secret for the identity, replacing any previous one.
    ///
    /// # Errors
    /// Returns an error if the system RNG fails.
    pub fn issue(&self, email: &str) -> Result<SecretString> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate continuation secret")?;
        let secret = SecretString::from(Base64UrlUnpadded::encode_string(&bytes));
        self.entries
            .lock()
            .expect("continuation lock poisoned")
            .insert(key_for(email), secret.clone());
        Ok(secret)
    }

    /// Consume the cached secret for the identity, if present. Single use.
    pub fn take(&self, email: &str) -> Option<SecretString> {
        self.entries
            .lock()
            .expect("continuation lock poisoned")
            .remove(&key_for(email))
    }

    #[must_use]
    pub fn has(&self, email: &str) -> bool {
        self.entries
            .lock()
            .expect("continuation lock poisoned")
            .contains_key(&key_for(email))
    }

    /// Wipe the entire namespace.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("continuation lock poisoned")
            .clear();
    }
}
