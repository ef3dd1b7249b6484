//! # Enirejo (Identity Verification & Enrollment Orchestration)
//!
//! `enirejo` is the front door of the platform: it verifies a claimed identity
//! through interchangeable strategies, collects whatever profile data is still
//! missing, publishes the resulting session for server-rendered pages, and
//! resolves the single landing destination for the signed-in user.
//!
//! ## Verification Strategies
//!
//! An identity claim (an email address) is proven by a one-time 8-digit code,
//! a clickable link, or a password. Strategies are interchangeable: rate
//! limits and cross-browser link opens fall back to the password path instead
//! of dead-ending, and every failure carries a classified reason.
//!
//! - **Code tags:** the backend recognizes several code type tags and does not
//!   say which one it used; verification walks them in fixed order and stops
//!   at the first success.
//! - **Continuation secrets:** link completion requires a secret cached in the
//!   requesting browser context, stored under an explicit namespace.
//!
//! ## Progressive Enrollment
//!
//! Which fields a run asks for is a pure function of how often the user has
//! enrolled before and which stored fields are empty. First-timers supply
//! name, gender, and a social handle; veterans are only asked for what is
//! still missing, and the phone step is the single skippable one.
//!
//! ## Session & Destination
//!
//! A verified session is encoded into one overwrite-in-place record keyed by
//! the backend project identifier, confirmed readable, and only then does
//! role resolution pick the landing destination from the affiliation sources
//! in strict priority order.

pub mod broker;
pub mod config;
pub mod directory;
pub mod enroll;
pub mod provider;
pub mod routes;
pub mod session_sync;
pub mod wizard;

pub use broker::{CredentialBroker, FallbackReason, FatalReason, Outcome, RetryReason};
pub use config::FlowConfig;
pub use directory::{Directory, ProfileRecord, ProfileUpdate, RoleSource};
pub use enroll::FieldId;
pub use provider::{IdentityProvider, Session};
pub use routes::{Destination, Landing, RoleResolver};
pub use session_sync::{MemorySessionStore, SessionStore, SessionSynchronizer};
pub use wizard::{FlowError, RegistrationOrchestrator, WizardPhase, WizardState};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
