//! Relational-store collaborator: profiles, enrollment counts, role sources.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::enroll::FieldId;

pub mod postgres;

/// Persisted user attributes touched by the enrollment flow.
///
/// Only the user's own completed steps mutate these; the subsystem never
/// deletes a record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileRecord {
    pub user_id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub social_handle: Option<String>,
}

impl ProfileRecord {
    #[must_use]
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    /// Whether a text field is missing for planning purposes.
    /// Whitespace-only values count as missing.
    #[must_use]
    pub fn is_blank(&self, field: FieldId) -> bool {
        let value = match field {
            FieldId::FirstName => self.first_name.as_deref(),
            FieldId::LastName => self.last_name.as_deref(),
            FieldId::Gender => self.gender.as_deref(),
            FieldId::Phone => self.phone.as_deref(),
            FieldId::SocialHandle => self.social_handle.as_deref(),
            FieldId::DateOfBirth => return self.date_of_birth.is_none(),
        };
        value.is_none_or(|value| value.trim().is_empty())
    }
}

/// Partial profile write; unset fields are left untouched by the upsert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub social_handle: Option<String>,
}

impl ProfileUpdate {
    /// Record one collected step value. Text is trimmed; blank stays unset
    /// except for the phone field, where an explicit blank clears the value.
    pub fn set(&mut self, field: FieldId, value: &str) {
        let trimmed = value.trim();
        match field {
            FieldId::FirstName => self.first_name = non_blank(trimmed),
            FieldId::LastName => self.last_name = non_blank(trimmed),
            FieldId::Gender => self.gender = non_blank(trimmed),
            FieldId::SocialHandle => self.social_handle = non_blank(trimmed),
            FieldId::Phone => self.phone = Some(trimmed.to_string()),
            FieldId::DateOfBirth => {
                self.date_of_birth = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok();
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn non_blank(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// One independent staff/performer affiliation source.
///
/// Sources are consulted in the fixed priority order of
/// [`crate::routes::PRIORITY`]; only row existence matters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleSource {
    Operator,
    DoorCrew,
    VenueStaff,
    OrganizerStaff,
    Promoter,
    Performer,
}

impl RoleSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RoleSource::Operator => "operator",
            RoleSource::DoorCrew => "door_crew",
            RoleSource::VenueStaff => "venue_staff",
            RoleSource::OrganizerStaff => "organizer_staff",
            RoleSource::Promoter => "promoter",
            RoleSource::Performer => "performer",
        }
    }
}

#[derive(Debug, Error)]
#[error("directory lookup failed: {0}")]
pub struct DirectoryError(#[from] pub anyhow::Error);

/// The relational store consumed by the planner, gate, and resolver.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>, DirectoryError>;

    /// Upsert keyed by user id; repeated writes with the same fields are no-ops.
    async fn upsert_profile(
        &self,
        user_id: Uuid,
        fields: &ProfileUpdate,
    ) -> Result<(), DirectoryError>;

    async fn count_prior_enrollments(&self, user_id: Uuid) -> Result<u32, DirectoryError>;

    /// Record one completed enrollment for the user.
    async fn record_enrollment(&self, user_id: Uuid) -> Result<(), DirectoryError>;

    /// Does at least one row exist for the user in this role source?
    async fn exists_in(&self, source: RoleSource, user_id: Uuid) -> Result<bool, DirectoryError>;
}
