//! Postgres-backed directory.

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{Directory, DirectoryError, ProfileRecord, ProfileUpdate, RoleSource};

/// Directory over the platform's relational store.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

/// Role sources map to fixed per-affiliation tables; the query only needs
/// existence, never row content.
fn affiliation_table(source: RoleSource) -> &'static str {
    match source {
        RoleSource::Operator => "operators",
        RoleSource::DoorCrew => "door_crew",
        RoleSource::VenueStaff => "venue_staff",
        RoleSource::OrganizerStaff => "organizer_staff",
        RoleSource::Promoter => "promoters",
        RoleSource::Performer => "performers",
    }
}

#[async_trait]
impl Directory for PgDirectory {
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>, DirectoryError> {
        let query = r"
            SELECT user_id, first_name, last_name, date_of_birth, gender, phone, social_handle
            FROM profiles
            WHERE user_id = $1
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to fetch profile")?;

        Ok(row.map(|row| ProfileRecord {
            user_id: row.get("user_id"),
            first_name: row.get("first_name"),
            last_name: row.get("last_name"),
            date_of_birth: row.get("date_of_birth"),
            gender: row.get("gender"),
            phone: row.get("phone"),
            social_handle: row.get("social_handle"),
        }))
    }

    async fn upsert_profile(
        &self,
        user_id: Uuid,
        fields: &ProfileUpdate,
    ) -> Result<(), DirectoryError> {
        // COALESCE keeps unset fields untouched, so repeating the same write
        // is a no-op and concurrent finalization retries cannot clobber data.
        let query = r"
            INSERT INTO profiles
                (user_id, first_name, last_name, date_of_birth, gender, phone, social_handle)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO UPDATE SET
                first_name = COALESCE(EXCLUDED.first_name, profiles.first_name),
                last_name = COALESCE(EXCLUDED.last_name, profiles.last_name),
                date_of_birth = COALESCE(EXCLUDED.date_of_birth, profiles.date_of_birth),
                gender = COALESCE(EXCLUDED.gender, profiles.gender),
                phone = COALESCE(EXCLUDED.phone, profiles.phone),
                social_handle = COALESCE(EXCLUDED.social_handle, profiles.social_handle)
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(fields.first_name.as_deref())
            .bind(fields.last_name.as_deref())
            .bind(fields.date_of_birth)
            .bind(fields.gender.as_deref())
            .bind(fields.phone.as_deref())
            .bind(fields.social_handle.as_deref())
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to upsert profile")?;
        Ok(())
    }

    async fn count_prior_enrollments(&self, user_id: Uuid) -> Result<u32, DirectoryError> {
        let query = "SELECT COUNT(*) AS total FROM enrollments WHERE user_id = $1";
        let row = sqlx::query(query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to count enrollments")?;
        let total: i64 = row.get("total");
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    async fn record_enrollment(&self, user_id: Uuid) -> Result<(), DirectoryError> {
        let query = "INSERT INTO enrollments (user_id) VALUES ($1)";
        sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to record enrollment")?;
        Ok(())
    }

    async fn exists_in(&self, source: RoleSource, user_id: Uuid) -> Result<bool, DirectoryError> {
        let table = affiliation_table(source);
        let query = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE user_id = $1) AS present");
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .with_context(|| format!("failed to check {} affiliation", source.as_str()))?;
        Ok(row.get("present"))
    }
}
