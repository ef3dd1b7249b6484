//! Registration wizard: the top-level sequencer.
//!
//! Owns the current phase, drives the credential broker until an identity is
//! verified, walks the progressive step plan, then publishes the session and
//! resolves the landing destination. Callers drive it one user action at a
//! time; every method returns the externally visible [`WizardState`].
//!
//! Phase graph:
//!
//! ```text
//! AwaitingIdentity -> VerifyingIdentity -> CollectingSteps* -> Finalizing -> Done
//!                          |    \-> AwaitingFinalGate -------^
//!                          v
//!                    PasswordFallback  (any fatal failure -> Failed)
//! ```

use secrecy::SecretString;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use ulid::Ulid;
use url::Url;

use crate::broker::{
    ContinuationCache, CredentialBroker, FallbackReason, FatalReason, Outcome, RetryReason,
    SendOutcome, normalize_email, valid_email,
};
use crate::config::FlowConfig;
use crate::directory::{Directory, ProfileRecord, ProfileUpdate};
use crate::enroll::gate::{self, ValidationError};
use crate::enroll::{self, FieldId};
use crate::provider::{IdentityProvider, Session};
use crate::routes::{Landing, RoleResolver};
use crate::session_sync::{SessionStore, SessionSynchronizer};


#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardPhase {
    AwaitingIdentity,
    VerifyingIdentity,
    PasswordFallback,
    CollectingSteps,
    AwaitingFinalGate,
    Finalizing,
    Done,
    Failed,
}

/// Classified error surfaced to the caller, one per failure taxonomy class.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case", tag = "class", content = "detail")]
pub enum FlowError {
    #[error("enter a valid email address")]
    InvalidEmail,
    #[error(transparent)]
    Retry(#[from] RetryReason),
    #[error(transparent)]
    Fallback(#[from] FallbackReason),
    #[error(transparent)]
    Fatal(#[from] FatalReason),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("finalization failed: {0}")]
    Finalization(String),
    #[error("action not available in this phase")]
    OutOfPhase,
}

/// Externally visible wizard state.
#[derive(Clone, Debug, Serialize)]
pub struct WizardState {
    pub run_id: String,
    pub phase: WizardPhase,
    pub email: Option<String>,
    pub current_step: Option<FieldId>,
    pub remaining_steps: Vec<FieldId>,
    pub final_gate_fields: Vec<FieldId>,
    pub last_error: Option<FlowError>,
    pub finalized: bool,
    pub destination: Option<Landing>,
}

pub struct RegistrationOrchestrator {
    broker: CredentialBroker,
    synchronizer: SessionSynchronizer,
    resolver: RoleResolver,
    directory: Arc<dyn Directory>,
    config: FlowConfig,
    redirect_target: Option<Url>,
    override_path: Option<String>,

    run_id: Ulid,
    phase: WizardPhase,
    email: Option<String>,
    session: Option<Session>,
    profile: Option<ProfileRecord>,
    registration_count: u32,
    plan: Vec<FieldId>,
    cursor: usize,
    update: ProfileUpdate,
    final_gate_fields: Vec<FieldId>,
    last_error: Option<FlowError>,
    enrollment_recorded: bool,
    landing: Option<Landing>,
}

impl RegistrationOrchestrator {
    /// Wire up a wizard from the three collaborators and a config.
    ///
    /// The collaborators are handed in explicitly; the wizard owns no global
    /// state and two wizards over different providers never interfere.
    #[must_use]
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        directory: Arc<dyn Directory>,
        store: Arc<dyn SessionStore>,
        config: FlowConfig,
    ) -> Self {
        let continuations = Arc::new(ContinuationCache::new());
        let broker =
            CredentialBroker::new(provider.clone(), continuations, store.clone(), &config);
        let synchronizer = SessionSynchronizer::new(store, provider, &config);
        let resolver = RoleResolver::new(directory.clone());
        Self {
            broker,
            synchronizer,
            resolver,
            directory,
            config,
            redirect_target: None,
            override_path: None,
            run_id: Ulid::new(),
            phase: WizardPhase::AwaitingIdentity,
            email: None,
            session: None,
            profile: None,
            registration_count: 0,
            plan: Vec::new(),
            cursor: 0,
            update: ProfileUpdate::default(),
            final_gate_fields: Vec::new(),
            last_error: None,
            enrollment_recorded: false,
            landing: None,
        }
    }

    /// Redirect target embedded in outgoing links.
    #[must_use]
    pub fn with_redirect_target(mut self, target: Url) -> Self {
        self.redirect_target = Some(target);
        self
    }

    /// Caller-supplied destination override, honored after verification when
    /// it matches a privileged route prefix.
    #[must_use]
    pub fn with_destination_override(mut self, path: String) -> Self {
        self.override_path = Some(path);
        self
    }

    #[must_use]
    pub fn state(&self) -> WizardState {
        WizardState {
            run_id: self.run_id.to_string(),
            phase: self.phase,
            email: self.email.clone(),
            current_step: if self.phase == WizardPhase::CollectingSteps {
                self.plan.get(self.cursor).copied()
            } else {
                None
            },
            remaining_steps: self.plan.get(self.cursor..).unwrap_or_default().to_vec(),
            final_gate_fields: self.final_gate_fields.clone(),
            last_error: self.last_error.clone(),
            finalized: self.phase == WizardPhase::Done,
            destination: self.landing.clone(),
        }
    }

    fn reset_run(&mut self) {
        self.run_id = Ulid::new();
        self.session = None;
        self.profile = None;
        self.registration_count = 0;
        self.plan = Vec::new();
        self.cursor = 0;
        self.update = ProfileUpdate::default();
        self.final_gate_fields = Vec::new();
        self.last_error = None;
        self.enrollment_recorded = false;
        self.landing = None;
    }

    fn out_of_phase(&mut self) -> WizardState {
        warn!(phase = ?self.phase, "Action not available in this phase");
        self.last_error = Some(FlowError::OutOfPhase);
        self.state()
    }

    /// Accept an identity claim and request a one-time code / link for it.
    ///
    /// Permitted before verification succeeds and after a fatal failure; a
    /// verified run cannot swap identities mid-flight.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn begin(&mut self, email: &str) -> WizardState {
        match self.phase {
            WizardPhase::AwaitingIdentity
            | WizardPhase::VerifyingIdentity
            | WizardPhase::PasswordFallback
            | WizardPhase::Failed => {}
            _ => return self.out_of_phase(),
        }
        let email = normalize_email(email);
        if !valid_email(&email) {
            self.last_error = Some(FlowError::InvalidEmail);
            self.phase = WizardPhase::AwaitingIdentity;
            return self.state();
        }
        self.reset_run();
        self.phase = WizardPhase::AwaitingIdentity;
        self.email = Some(email.clone());
        self.request_code_into_phase(&email).await;
        self.state()
    }

    /// Re-send the code for the claim already on file.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn resend_code(&mut self) -> WizardState {
        if self.phase != WizardPhase::VerifyingIdentity {
            return self.out_of_phase();
        }
        let Some(email) = self.email.clone() else {
            return self.out_of_phase();
        };
        self.request_code_into_phase(&email).await;
        self.state()
    }

    async fn request_code_into_phase(&mut self, email: &str) {
        let outcome = self
            .broker
            .request_code(email, self.redirect_target.as_ref())
            .await;
        match outcome {
            SendOutcome::Sent => {
                self.last_error = None;
                self.phase = WizardPhase::VerifyingIdentity;
            }
            SendOutcome::Retry(reason) => {
                self.last_error = Some(FlowError::Retry(reason));
            }
            SendOutcome::Fallback(reason) => {
                debug!("Falling back to password entry: {reason}");
                self.last_error = Some(FlowError::Fallback(reason));
                self.phase = WizardPhase::PasswordFallback;
            }
            SendOutcome::Fatal(reason) => {
                self.last_error = Some(FlowError::Fatal(reason));
                self.phase = WizardPhase::Failed;
            }
        }
    }

    /// Submit a one-time code typed by the user.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn submit_code(&mut self, input: &str) -> WizardState {
        if self.phase != WizardPhase::VerifyingIdentity {
            return self.out_of_phase();
        }
        let Some(email) = self.email.clone() else {
            return self.out_of_phase();
        };
        let outcome = self.broker.verify_code(&email, input).await;
        self.apply_verification_outcome(outcome).await;
        self.state()
    }

    /// Complete a clickable link opened in this browser context.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn open_link(&mut self, link_code: &str) -> WizardState {
        if self.phase != WizardPhase::VerifyingIdentity {
            return self.out_of_phase();
        }
        let Some(email) = self.email.clone() else {
            return self.out_of_phase();
        };
        let outcome = self.broker.redeem_link(&email, link_code).await;
        self.apply_verification_outcome(outcome).await;
        self.state()
    }

    /// Submit a password; with a confirmation value the account is created
    /// first.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn submit_password(
        &mut self,
        secret: &SecretString,
        confirm: Option<&SecretString>,
    ) -> WizardState {
        if self.phase != WizardPhase::PasswordFallback {
            return self.out_of_phase();
        }
        let Some(email) = self.email.clone() else {
            return self.out_of_phase();
        };
        let outcome = self.broker.password(&email, secret, confirm).await;
        self.apply_verification_outcome(outcome).await;
        self.state()
    }

    async fn apply_verification_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Verified(session) => {
                self.last_error = None;
                self.on_verified(session).await;
            }
            // Retryable: stay in place, the user corrects their input.
            Outcome::Retry(reason) => {
                self.last_error = Some(FlowError::Retry(reason));
            }
            Outcome::Fallback(reason) => {
                debug!("Falling back to password entry: {reason}");
                self.last_error = Some(FlowError::Fallback(reason));
                self.phase = WizardPhase::PasswordFallback;
            }
            Outcome::Fatal(reason) => {
                error!("Verification failed fatally: {reason}");
                self.last_error = Some(FlowError::Fatal(reason));
                self.phase = WizardPhase::Failed;
            }
        }
    }

    async fn on_verified(&mut self, session: Session) {
        let user_id = session.user_id;
        self.session = Some(session);

        let profile = match self.directory.get_profile(user_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                // First successful verification materializes the record.
                if let Err(err) = self
                    .directory
                    .upsert_profile(user_id, &ProfileUpdate::default())
                    .await
                {
                    return self.fail_backend(format!("failed to create profile: {err}"));
                }
                ProfileRecord::empty(user_id)
            }
            Err(err) => {
                return self.fail_backend(format!("failed to load profile: {err}"));
            }
        };
        let count = match self.directory.count_prior_enrollments(user_id).await {
            Ok(count) => count,
            Err(err) => {
                return self.fail_backend(format!("failed to count enrollments: {err}"));
            }
        };

        // The plan is computed exactly once per run; changing answers later
        // never changes which fields are asked.
        self.plan = enroll::plan(count, &profile);
        self.cursor = 0;
        self.registration_count = count;
        self.profile = Some(profile);
        debug!(count, steps = self.plan.len(), "Identity verified");

        if self.plan.is_empty() {
            self.prepare_finalization().await;
        } else {
            self.phase = WizardPhase::CollectingSteps;
        }
    }

    fn fail_backend(&mut self, message: String) {
        error!("{message}");
        self.last_error = Some(FlowError::Fatal(FatalReason::Backend { message }));
        self.phase = WizardPhase::Failed;
    }

    /// Submit the value for the current step.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn submit_step(&mut self, value: &str) -> WizardState {
        if self.phase != WizardPhase::CollectingSteps {
            return self.out_of_phase();
        }
        let Some(&field) = self.plan.get(self.cursor) else {
            return self.out_of_phase();
        };
        if let Err(err) = gate::validate(
            field,
            value,
            self.registration_count,
            self.config.min_age_signup(),
            self.config.max_age(),
        ) {
            // Validation blocks advancement only; it is never a system error.
            self.last_error = Some(FlowError::Validation(err));
            return self.state();
        }
        self.last_error = None;
        self.update.set(field, value);
        self.advance().await;
        self.state()
    }

    /// Skip the current step. Equivalent to submitting an empty value and
    /// only honored for skippable steps.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn skip_step(&mut self) -> WizardState {
        if self.phase != WizardPhase::CollectingSteps {
            return self.out_of_phase();
        }
        let Some(&field) = self.plan.get(self.cursor) else {
            return self.out_of_phase();
        };
        if !field.skippable(self.registration_count) {
            self.last_error = Some(FlowError::Validation(ValidationError::Required { field }));
            return self.state();
        }
        // Clear the pending value and advance exactly like a submission.
        self.last_error = None;
        self.update.set(field, "");
        self.advance().await;
        self.state()
    }

    /// Return to an earlier step of the same run. The queue itself is fixed.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub fn back_to(&mut self, field: FieldId) -> WizardState {
        if self.phase != WizardPhase::CollectingSteps {
            return self.out_of_phase();
        }
        match self.plan[..self.cursor].iter().position(|&f| f == field) {
            Some(position) => {
                self.cursor = position;
                self.last_error = None;
            }
            None => {
                self.last_error = Some(FlowError::OutOfPhase);
            }
        }
        self.state()
    }

    async fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.plan.len() {
            self.prepare_finalization().await;
        }
    }

    async fn prepare_finalization(&mut self) {
        // Returning identities that had nothing left to collect may still be
        // missing the minimal survival set; attendees detour into a one-shot
        // completion form, staff-bound landings never do.
        if self.registration_count >= 1 && self.plan.is_empty() {
            if let Some(profile) = &self.profile {
                if let Some(session) = &self.session {
                    let landing = self
                        .resolver
                        .resolve(session.user_id, self.override_path.as_deref())
                        .await;
                    if !landing.destination.staff_bound() && !gate::basic_profile_complete(profile)
                    {
                        self.final_gate_fields = missing_basic_fields(profile);
                        self.phase = WizardPhase::AwaitingFinalGate;
                        return;
                    }
                }
            }
        }
        self.phase = WizardPhase::Finalizing;
        self.finalize_once().await;
    }

    /// Complete the one-shot basic-profile form.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn submit_final_gate(&mut self, values: &[(FieldId, String)]) -> WizardState {
        if self.phase != WizardPhase::AwaitingFinalGate {
            return self.out_of_phase();
        }
        let required = self.final_gate_fields.clone();
        for &field in &required {
            let Some((_, value)) = values.iter().find(|(candidate, _)| *candidate == field) else {
                self.last_error = Some(FlowError::Validation(ValidationError::Required { field }));
                return self.state();
            };
            // The survival set is never skippable, and its date of birth uses
            // the stricter age floor.
            if let Err(err) = gate::validate(
                field,
                value,
                0,
                self.config.min_age_basic_gate(),
                self.config.max_age(),
            ) {
                self.last_error = Some(FlowError::Validation(err));
                return self.state();
            }
        }
        for &field in &required {
            if let Some((_, value)) = values.iter().find(|(candidate, _)| *candidate == field) {
                self.update.set(field, value);
            }
        }
        self.last_error = None;
        self.final_gate_fields.clear();
        self.phase = WizardPhase::Finalizing;
        self.finalize_once().await;
        self.state()
    }

    /// Retry finalization after a recoverable failure, without re-verifying
    /// the identity.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub async fn retry_finalize(&mut self) -> WizardState {
        if self.phase != WizardPhase::Finalizing {
            return self.out_of_phase();
        }
        self.finalize_once().await;
        self.state()
    }

    /// One finalization pass: profile upsert, session publish, enrollment
    /// record, destination resolution. Every write is overwrite- or
    /// guard-based, so re-entry cannot duplicate anything.
    async fn finalize_once(&mut self) {
        let Some(session) = self.session.clone() else {
            self.last_error = Some(FlowError::OutOfPhase);
            self.phase = WizardPhase::Failed;
            return;
        };
        let user_id = session.user_id;

        if !self.update.is_empty() {
            if let Err(err) = self.directory.upsert_profile(user_id, &self.update).await {
                warn!("Profile write failed, finalization can be retried: {err}");
                self.last_error = Some(FlowError::Finalization(err.to_string()));
                return;
            }
        }
        if let Err(err) = self.synchronizer.publish(&session).await {
            warn!("Session publish failed, finalization can be retried: {err}");
            self.last_error = Some(FlowError::Finalization(err.to_string()));
            return;
        }
        if !self.enrollment_recorded {
            if let Err(err) = self.directory.record_enrollment(user_id).await {
                warn!("Enrollment record failed, finalization can be retried: {err}");
                self.last_error = Some(FlowError::Finalization(err.to_string()));
                return;
            }
            self.enrollment_recorded = true;
        }

        let landing = self
            .resolver
            .resolve(user_id, self.override_path.as_deref())
            .await;
        debug!(destination = ?landing.destination, "Enrollment finalized");
        self.landing = Some(landing);
        self.last_error = None;
        self.phase = WizardPhase::Done;
    }

    /// Clear the durable session record and reset to a fresh run.
    #[instrument(skip_all, fields(run = %self.run_id))]
    pub fn sign_out(&mut self) -> WizardState {
        self.synchronizer.clear();
        self.reset_run();
        self.email = None;
        self.phase = WizardPhase::AwaitingIdentity;
        self.state()
    }

    /// The session published by this run, if finalization completed.
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }
}

/// Which of the minimal survival set is still missing.
fn missing_basic_fields(profile: &ProfileRecord) -> Vec<FieldId> {
    [
        FieldId::FirstName,
        FieldId::LastName,
        FieldId::DateOfBirth,
        FieldId::Phone,
    ]
    .into_iter()
    .filter(|&field| profile.is_blank(field))
    .collect()
}
