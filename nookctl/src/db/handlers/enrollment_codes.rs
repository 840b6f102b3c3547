//! Database repository for enrollment codes.
//!
//! Codes are written once and never updated, so this is a handful of queries rather than a full
//! [`super::Repository`].

use crate::db::{
    errors::Result,
    models::enrollment_codes::{EnrollmentCodeCreateDBRequest, EnrollmentCodeDBResponse},
};
use crate::types::{FamilyId, abbrev_uuid};
use sqlx::PgConnection;
use tracing::instrument;

/// Unique constraint on the code itself
pub const ENROLLMENT_CODE_UNIQUE: &str = "enrollment_codes_code_unique";

const ENROLLMENT_CODE_COLUMNS: &str = "id, family_id, code, external_enrollment_ref, enrollment_url, expires_at, created_at";

pub struct EnrollmentCodes<'c> {
    db: &'c mut PgConnection,
}

impl<'c> EnrollmentCodes<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(family_id = %abbrev_uuid(&request.family_id)), err)]
    pub async fn create(&mut self, request: &EnrollmentCodeCreateDBRequest) -> Result<EnrollmentCodeDBResponse> {
        let code = sqlx::query_as::<_, EnrollmentCodeDBResponse>(&format!(
            r#"
            INSERT INTO enrollment_codes (family_id, code, external_enrollment_ref, enrollment_url, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {ENROLLMENT_CODE_COLUMNS}
            "#
        ))
        .bind(request.family_id)
        .bind(&request.code)
        .bind(&request.external_enrollment_ref)
        .bind(&request.enrollment_url)
        .bind(request.expires_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(code)
    }

    #[instrument(skip(self, code), err)]
    pub async fn get_by_code(&mut self, code: &str) -> Result<Option<EnrollmentCodeDBResponse>> {
        let found = sqlx::query_as::<_, EnrollmentCodeDBResponse>(&format!(
            "SELECT {ENROLLMENT_CODE_COLUMNS} FROM enrollment_codes WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&mut *self.db)
        .await?;

        Ok(found)
    }

    /// Newest first.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn list_for_family(&mut self, family_id: FamilyId) -> Result<Vec<EnrollmentCodeDBResponse>> {
        let codes = sqlx::query_as::<_, EnrollmentCodeDBResponse>(&format!(
            "SELECT {ENROLLMENT_CODE_COLUMNS} FROM enrollment_codes WHERE family_id = $1 ORDER BY created_at DESC, id"
        ))
        .bind(family_id)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(codes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::errors::DbError;
    use crate::db::handlers::{Families, Repository};
    use crate::db::models::families::FamilyCreateDBRequest;
    use chrono::{Duration, Utc};
    use sqlx::{Acquire, PgPool};
    use uuid::Uuid;

    #[sqlx::test]
    #[test_log::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_codes_are_unique_and_cascade_with_family(pool: PgPool) {
        let mut tx = pool.begin().await.unwrap();
        let family = Families::new(tx.acquire().await.unwrap())
            .create(&FamilyCreateDBRequest {
                name: "Haddad".to_string(),
                parent_id: Uuid::new_v4(),
                external_group_ref: Some("12".to_string()),
            })
            .await
            .unwrap();

        let request = EnrollmentCodeCreateDBRequest {
            family_id: family.id,
            code: "482913".to_string(),
            external_enrollment_ref: "3301".to_string(),
            enrollment_url: "https://a.simplemdm.com/enroll/?c=1".to_string(),
            expires_at: Utc::now() + Duration::hours(24),
        };
        let mut repo = EnrollmentCodes::new(tx.acquire().await.unwrap());
        let created = repo.create(&request).await.unwrap();
        assert_eq!(repo.get_by_code("482913").await.unwrap(), Some(created));

        let duplicate = repo.create(&request).await.unwrap_err();
        assert!(duplicate.is_unique_violation_on(ENROLLMENT_CODE_UNIQUE));
        tx.commit().await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(Families::new(&mut conn).delete(family.id).await.unwrap());
        assert!(EnrollmentCodes::new(&mut conn).get_by_code("482913").await.unwrap().is_none());

        let mut conn = pool.acquire().await.unwrap();
        let bad = EnrollmentCodes::new(&mut conn)
            .create(&EnrollmentCodeCreateDBRequest {
                code: "12ab".to_string(),
                ..request
            })
            .await
            .unwrap_err();
        assert!(matches!(bad, DbError::CheckViolation { .. } | DbError::ForeignKeyViolation { .. }));
    }
}
