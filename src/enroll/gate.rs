//! Per-field validation and the basic-profile completeness check.

use chrono::{NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use super::FieldId;
use crate::directory::ProfileRecord;

/// Validation failures are local to step advancement; they never surface as
/// system errors.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: FieldId },
    #[error("enter a valid phone number")]
    PhoneFormat,
    #[error("enter a date as YYYY-MM-DD")]
    DateFormat,
    #[error("you must be at least {min} years old")]
    TooYoung { min: u32 },
    #[error("enter a real date of birth")]
    ImplausibleDate,
}

/// International phone shape: optional `+`, 2-15 digits.
fn valid_phone(value: &str) -> bool {
    Regex::new(r"^\+?[0-9]{2,15}$").is_ok_and(|regex| regex.is_match(value))
}

/// Validate one collected step value.
///
/// The phone step for veteran users is skippable: a blank value is accepted
/// and short-circuits before any format checking.
pub fn validate(
    field: FieldId,
    value: &str,
    registration_count: u32,
    min_age: u32,
    max_age: u32,
) -> Result<(), ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        if field.skippable(registration_count) {
            return Ok(());
        }
        return Err(ValidationError::Required { field });
    }
    match field {
        FieldId::Phone => {
            if valid_phone(trimmed) {
                Ok(())
            } else {
                Err(ValidationError::PhoneFormat)
            }
        }
        FieldId::DateOfBirth => validate_date_of_birth(trimmed, min_age, max_age).map(|_| ()),
        FieldId::FirstName | FieldId::LastName | FieldId::Gender | FieldId::SocialHandle => Ok(()),
    }
}

/// Parse a date of birth and check the computed age against [min_age, max_age].
pub fn validate_date_of_birth(
    value: &str,
    min_age: u32,
    max_age: u32,
) -> Result<NaiveDate, ValidationError> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| ValidationError::DateFormat)?;
    let today = Utc::now().date_naive();
    let Some(age) = today.years_since(date) else {
        // Future dates have no age.
        return Err(ValidationError::ImplausibleDate);
    };
    if age < min_age {
        return Err(ValidationError::TooYoung { min: min_age });
    }
    if age > max_age {
        return Err(ValidationError::ImplausibleDate);
    }
    Ok(date)
}

/// The minimal survival set required of returning attendees: name, surname,
/// date of birth, and a reachable contact number.
#[must_use]
pub fn basic_profile_complete(profile: &ProfileRecord) -> bool {
    !profile.is_blank(FieldId::FirstName)
        && !profile.is_blank(FieldId::LastName)
        && !profile.is_blank(FieldId::DateOfBirth)
        && !profile.is_blank(FieldId::Phone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use uuid::Uuid;

    #[test]
    fn required_fields_reject_blank() {
        let err = validate(FieldId::FirstName, "   ", 0, 13, 120);
        assert_eq!(
            err,
            Err(ValidationError::Required {
                field: FieldId::FirstName
            })
        );
    }

    #[test]
    fn veteran_phone_blank_short_circuits() {
        // Skippable blank is accepted without touching the format check.
        assert_eq!(validate(FieldId::Phone, "", 2, 13, 120), Ok(()));
        assert_eq!(validate(FieldId::Phone, "  ", 5, 13, 120), Ok(()));
        // Below the veteran bucket the same blank is still required.
        assert_eq!(
            validate(FieldId::Phone, "", 1, 13, 120),
            Err(ValidationError::Required {
                field: FieldId::Phone
            })
        );
    }

    #[test]
    fn phone_format_accepts_international_shapes() {
        assert_eq!(validate(FieldId::Phone, "+4915112345678", 2, 13, 120), Ok(()));
        assert_eq!(validate(FieldId::Phone, "080012345", 0, 13, 120), Ok(()));
        assert_eq!(
            validate(FieldId::Phone, "not-a-number", 2, 13, 120),
            Err(ValidationError::PhoneFormat)
        );
        // Too short and too long fall outside the 2-15 digit window.
        assert_eq!(
            validate(FieldId::Phone, "+1", 2, 13, 120),
            Err(ValidationError::PhoneFormat)
        );
        assert_eq!(
            validate(FieldId::Phone, "1234567890123456", 2, 13, 120),
            Err(ValidationError::PhoneFormat)
        );
    }

    #[test]
    fn date_of_birth_rejects_garbage_and_impossible_dates() {
        assert_eq!(
            validate_date_of_birth("not-a-date", 13, 120),
            Err(ValidationError::DateFormat)
        );
        assert_eq!(
            validate_date_of_birth("2020-02-30", 13, 120),
            Err(ValidationError::DateFormat)
        );
    }

    #[test]
    fn date_of_birth_enforces_age_window() {
        let today = Utc::now().date_naive();
        let ten_years_old = format!("{}-01-01", today.year() - 10);
        assert_eq!(
            validate_date_of_birth(&ten_years_old, 13, 120),
            Err(ValidationError::TooYoung { min: 13 })
        );
        // The stricter gate rejects a 16-year-old that general signup accepts.
        let sixteen = format!("{}-01-01", today.year() - 16);
        assert!(validate_date_of_birth(&sixteen, 13, 120).is_ok());
        assert_eq!(
            validate_date_of_birth(&sixteen, 18, 120),
            Err(ValidationError::TooYoung { min: 18 })
        );
        let ancient = format!("{}-01-01", today.year() - 130);
        assert_eq!(
            validate_date_of_birth(&ancient, 13, 120),
            Err(ValidationError::ImplausibleDate)
        );
        let future = format!("{}-01-01", today.year() + 1);
        assert_eq!(
            validate_date_of_birth(&future, 13, 120),
            Err(ValidationError::ImplausibleDate)
        );
    }

    #[test]
    fn basic_profile_needs_all_four_fields() {
        let mut profile = ProfileRecord::empty(Uuid::new_v4());
        assert!(!basic_profile_complete(&profile));
        profile.first_name = Some("Ada".to_string());
        profile.last_name = Some("Lovelace".to_string());
        profile.date_of_birth = NaiveDate::from_ymd_opt(1990, 12, 10);
        assert!(!basic_profile_complete(&profile));
        profile.phone = Some("+4915112345678".to_string());
        assert!(basic_profile_complete(&profile));
        // Social handle and gender play no part in the survival set.
        assert!(profile.gender.is_none());
    }
}
