//! Flow configuration shared by the broker, synchronizer, and wizard.

use std::time::Duration;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONFIRM_RETRY_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MIN_PASSWORD_LEN: usize = 6;
const DEFAULT_MIN_AGE_SIGNUP: u32 = 13;
const DEFAULT_MIN_AGE_BASIC_GATE: u32 = 18;
const DEFAULT_MAX_AGE: u32 = 120;

/// Configuration for one enrollment flow.
///
/// Construct with [`FlowConfig::new`] and adjust with the `with_*` builders.
/// The project ref keys the durable session record so server-rendered requests
/// can find it without knowing anything else about the flow.
#[derive(Clone, Debug)]
pub struct FlowConfig {
    project_ref: String,
    call_timeout: Duration,
    password_retry_backoff: Vec<Duration>,
    confirm_retry_delay: Duration,
    min_password_len: usize,
    min_age_signup: u32,
    min_age_basic_gate: u32,
    max_age: u32,
    secure_cookies: bool,
}

impl FlowConfig {
    #[must_use]
    pub fn new(project_ref: String) -> Self {
        Self {
            project_ref,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            password_retry_backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(3),
                Duration::from_secs(4),
            ],
            confirm_retry_delay: DEFAULT_CONFIRM_RETRY_DELAY,
            min_password_len: DEFAULT_MIN_PASSWORD_LEN,
            min_age_signup: DEFAULT_MIN_AGE_SIGNUP,
            min_age_basic_gate: DEFAULT_MIN_AGE_BASIC_GATE,
            max_age: DEFAULT_MAX_AGE,
            secure_cookies: true,
        }
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Backoff slept before sign-in retries 2..=N after account creation.
    /// The list length bounds the retry count: N = list length + 1 attempts.
    #[must_use]
    pub fn with_password_retry_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.password_retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_confirm_retry_delay(mut self, delay: Duration) -> Self {
        self.confirm_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_min_password_len(mut self, len: usize) -> Self {
        self.min_password_len = len;
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    #[must_use]
    pub fn project_ref(&self) -> &str {
        &self.project_ref
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub(crate) fn password_retry_backoff(&self) -> &[Duration] {
        &self.password_retry_backoff
    }

    pub(crate) fn confirm_retry_delay(&self) -> Duration {
        self.confirm_retry_delay
    }

    pub(crate) fn min_password_len(&self) -> usize {
        self.min_password_len
    }

    pub(crate) fn min_age_signup(&self) -> u32 {
        self.min_age_signup
    }

    pub(crate) fn min_age_basic_gate(&self) -> u32 {
        self.min_age_basic_gate
    }

    pub(crate) fn max_age(&self) -> u32 {
        self.max_age
    }

    pub(crate) fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }
}
