//! Progressive data collection: which profile fields a run still has to ask for.
//!
//! The plan is a pure function of the registration-count bucket and per-field
//! emptiness of the stored profile. It is computed once when a run enters the
//! collection phase and never recomputed mid-flow, so the set of questions a
//! user sees cannot change under them.

use serde::Serialize;

use crate::directory::ProfileRecord;

pub mod gate;

/// Identifier of one collectible profile field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldId {
    FirstName,
    LastName,
    DateOfBirth,
    Gender,
    Phone,
    SocialHandle,
}

impl FieldId {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FieldId::FirstName => "first_name",
            FieldId::LastName => "last_name",
            FieldId::DateOfBirth => "date_of_birth",
            FieldId::Gender => "gender",
            FieldId::Phone => "phone",
            FieldId::SocialHandle => "social_handle",
        }
    }

    /// The phone step is the only skippable one, and only for veterans.
    #[must_use]
    pub fn skippable(self, registration_count: u32) -> bool {
        self == FieldId::Phone && registration_count >= 2
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields requested for a registration-count bucket, before emptiness filtering.
/// First-timers are deliberately not asked for date of birth or phone.
fn bucket_fields(registration_count: u32) -> &'static [FieldId] {
    match registration_count {
        0 => &[
            FieldId::FirstName,
            FieldId::LastName,
            FieldId::Gender,
            FieldId::SocialHandle,
        ],
        1 => &[FieldId::SocialHandle],
        _ => &[FieldId::Phone],
    }
}

/// Compute the ordered, de-duplicated list of fields still required.
///
/// Already-populated fields are never re-asked. An empty result means the run
/// auto-finalizes without presenting a single step.
#[must_use]
pub fn plan(registration_count: u32, profile: &ProfileRecord) -> Vec<FieldId> {
    let mut steps = Vec::new();
    for &field in bucket_fields(registration_count) {
        if profile.is_blank(field) && !steps.contains(&field) {
            steps.push(field);
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn full_profile() -> ProfileRecord {
        ProfileRecord {
            user_id: Uuid::new_v4(),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 12, 10),
            gender: Some("female".to_string()),
            phone: Some("+4915112345678".to_string()),
            social_handle: Some("@ada".to_string()),
        }
    }

    #[test]
    fn first_run_asks_four_fields_in_order() {
        let profile = ProfileRecord::empty(Uuid::new_v4());
        assert_eq!(
            plan(0, &profile),
            vec![
                FieldId::FirstName,
                FieldId::LastName,
                FieldId::Gender,
                FieldId::SocialHandle,
            ]
        );
    }

    #[test]
    fn first_run_never_asks_dob_or_phone() {
        let profile = ProfileRecord::empty(Uuid::new_v4());
        let steps = plan(0, &profile);
        assert!(!steps.contains(&FieldId::DateOfBirth));
        assert!(!steps.contains(&FieldId::Phone));
    }

    #[test]
    fn second_run_asks_social_handle_only_if_missing() {
        let mut profile = full_profile();
        profile.social_handle = None;
        assert_eq!(plan(1, &profile), vec![FieldId::SocialHandle]);

        assert_eq!(plan(1, &full_profile()), Vec::<FieldId>::new());
    }

    #[test]
    fn veteran_runs_ask_phone_only_if_missing() {
        let mut profile = full_profile();
        profile.phone = None;
        assert_eq!(plan(2, &profile), vec![FieldId::Phone]);
        assert_eq!(plan(7, &profile), vec![FieldId::Phone]);

        assert_eq!(plan(2, &full_profile()), Vec::<FieldId>::new());
    }

    #[test]
    fn full_profile_yields_empty_plan_for_any_count() {
        for count in [0, 1, 2, 5, 100] {
            assert_eq!(plan(count, &full_profile()), Vec::<FieldId>::new());
        }
    }

    #[test]
    fn populated_fields_are_never_re_asked() {
        let mut profile = ProfileRecord::empty(Uuid::new_v4());
        profile.first_name = Some("Ada".to_string());
        profile.gender = Some("female".to_string());
        assert_eq!(
            plan(0, &profile),
            vec![FieldId::LastName, FieldId::SocialHandle]
        );
    }

    #[test]
    fn plan_is_deterministic() {
        let mut profile = ProfileRecord::empty(Uuid::new_v4());
        profile.last_name = Some("Lovelace".to_string());
        let first = plan(0, &profile);
        let second = plan(0, &profile);
        assert_eq!(first, second);
    }

    #[test]
    fn only_veteran_phone_is_skippable() {
        assert!(FieldId::Phone.skippable(2));
        assert!(FieldId::Phone.skippable(9));
        assert!(!FieldId::Phone.skippable(1));
        assert!(!FieldId::SocialHandle.skippable(5));
        assert!(!FieldId::FirstName.skippable(0));
    }
}
