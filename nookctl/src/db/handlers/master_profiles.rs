//! Database repository for master profiles.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::master_profiles::{MasterProfileCreateDBRequest, MasterProfileDBResponse, MasterProfileUpdateDBRequest},
};
use crate::types::{MasterProfileId, Operation, ProfileType, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

const MASTER_PROFILE_COLUMNS: &str = "id, profile_type, name, description, external_profile_ref, created_at";

/// Name of the unique constraint that keeps one master profile per type.
pub const MASTER_PROFILE_TYPE_UNIQUE: &str = "master_profiles_type_unique";

/// Filter for listing master profiles
#[derive(Debug, Clone, Default)]
pub struct MasterProfileFilter {
    pub profile_type: Option<ProfileType>,
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct MasterProfile {
    id: MasterProfileId,
    profile_type: String,
    name: String,
    description: Option<String>,
    external_profile_ref: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MasterProfile> for MasterProfileDBResponse {
    type Error = DbError;

    fn try_from(row: MasterProfile) -> Result<Self> {
        let profile_type = row
            .profile_type
            .parse()
            .map_err(|e: String| DbError::Other(anyhow::anyhow!("master profile {}: {e}", row.id)))?;

        Ok(Self {
            id: row.id,
            profile_type,
            name: row.name,
            description: row.description,
            external_profile_ref: row.external_profile_ref,
            created_at: row.created_at,
        })
    }
}

pub struct MasterProfiles<'c> {
    db: &'c mut PgConnection,
}

impl<'c> MasterProfiles<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(profile_type = %profile_type), err)]
    pub async fn get_by_type(&mut self, profile_type: ProfileType) -> Result<Option<MasterProfileDBResponse>> {
        let row = sqlx::query_as::<_, MasterProfile>(&format!(
            "SELECT {MASTER_PROFILE_COLUMNS} FROM master_profiles WHERE profile_type = $1"
        ))
        .bind(profile_type.as_str())
        .fetch_optional(&mut *self.db)
        .await?;

        row.map(MasterProfileDBResponse::try_from).transpose()
    }

    /// Number of family profiles currently pointing at this master profile.
    #[instrument(skip(self), fields(master_profile_id = %abbrev_uuid(&id)), err)]
    pub async fn count_references(&mut self, id: MasterProfileId) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM family_profiles WHERE master_profile_id = $1")
            .bind(id)
            .fetch_one(&mut *self.db)
            .await?;

        Ok(count)
    }
}

#[async_trait::async_trait]
impl<'c> Repository for MasterProfiles<'c> {
    type CreateRequest = MasterProfileCreateDBRequest;
    type UpdateRequest = MasterProfileUpdateDBRequest;
    type Response = MasterProfileDBResponse;
    type Id = MasterProfileId;
    type Filter = MasterProfileFilter;

    #[instrument(skip(self, request), fields(profile_type = %request.profile_type), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, MasterProfile>(&format!(
            r#"
            INSERT INTO master_profiles (profile_type, name, description, external_profile_ref)
            VALUES ($1, $2, $3, $4)
            RETURNING {MASTER_PROFILE_COLUMNS}
            "#
        ))
        .bind(request.profile_type.as_str())
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.external_profile_ref)
        .fetch_one(&mut *self.db)
        .await?;

        MasterProfileDBResponse::try_from(row)
    }

    #[instrument(skip(self), fields(master_profile_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let row = sqlx::query_as::<_, MasterProfile>(&format!("SELECT {MASTER_PROFILE_COLUMNS} FROM master_profiles WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        row.map(MasterProfileDBResponse::try_from).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<MasterProfileId>) -> Result<HashMap<MasterProfileId, MasterProfileDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, MasterProfile>(&format!(
            "SELECT {MASTER_PROFILE_COLUMNS} FROM master_profiles WHERE id = ANY($1)"
        ))
        .bind(ids.as_slice())
        .fetch_all(&mut *self.db)
        .await?;

        rows.into_iter()
            .map(|row| MasterProfileDBResponse::try_from(row).map(|m| (m.id, m)))
            .collect()
    }

    #[instrument(skip(self, filter), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut query = QueryBuilder::new(format!("SELECT {MASTER_PROFILE_COLUMNS} FROM master_profiles WHERE 1=1"));

        if let Some(profile_type) = filter.profile_type {
            query.push(" AND profile_type = ");
            query.push_bind(profile_type.as_str());
        }

        query.push(" ORDER BY created_at, id");

        let rows = query.build_query_as::<MasterProfile>().fetch_all(&mut *self.db).await?;

        rows.into_iter().map(MasterProfileDBResponse::try_from).collect()
    }

    #[instrument(skip(self), fields(master_profile_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let references = self.count_references(id).await?;
        if references > 0 {
            return Err(DbError::ProtectedEntity {
                operation: Operation::Delete,
                reason: format!("still used by {references} family profile(s)"),
                entity_type: "MasterProfile".to_string(),
                entity_id: Some(id.to_string()),
            });
        }

        let result = sqlx::query("DELETE FROM master_profiles WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(master_profile_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, MasterProfile>(&format!(
            r#"
            UPDATE master_profiles SET
                name = COALESCE($2, name),
                description = COALESCE($3, description)
            WHERE id = $1
            RETURNING {MASTER_PROFILE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(&request.description)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        MasterProfileDBResponse::try_from(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    fn guardian() -> MasterProfileCreateDBRequest {
        MasterProfileCreateDBRequest {
            profile_type: ProfileType::Guardian,
            name: "Guardian (Global)".to_string(),
            description: Some(ProfileType::Guardian.default_description().to_string()),
            external_profile_ref: "9001".to_string(),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_one_master_profile_per_type(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = MasterProfiles::new(&mut conn);

        let created = repo.create(&guardian()).await.unwrap();
        assert_eq!(repo.get_by_type(ProfileType::Guardian).await.unwrap(), Some(created));

        let err = repo.create(&guardian()).await.unwrap_err();
        assert!(err.is_unique_violation_on(MASTER_PROFILE_TYPE_UNIQUE), "unexpected error: {err:?}");
    }
}
