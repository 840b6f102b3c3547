//! Database repository for family profiles.
//!
//! Reads always join the owning master profile so the external reference is resolved in the same
//! query that loads the row.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::family_profiles::{
        FamilyProfileCreateDBRequest, FamilyProfileDBResponse, FamilyProfileUpdateDBRequest, NewProfileSource, ProfileSource,
    },
};
use crate::types::{FamilyId, FamilyProfileId, MasterProfileId, ProfileType, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

/// Name of the partial unique index allowing each predefined type once per family.
pub const FAMILY_PREDEFINED_TYPE_UNIQUE: &str = "family_profiles_predefined_type_unique";

const SELECT_RESOLVED: &str = r#"
    SELECT fp.id, fp.family_id, fp.profile_type, fp.name, fp.description, fp.config,
           fp.master_profile_id, fp.individual_profile_ref,
           mp.external_profile_ref AS master_profile_ref,
           fp.created_at, fp.updated_at
"#;

/// Filter for listing family profiles
#[derive(Debug, Clone, Default)]
pub struct FamilyProfileFilter {
    pub family_id: Option<FamilyId>,
    pub profile_type: Option<ProfileType>,
    pub master_profile_id: Option<MasterProfileId>,
}

impl FamilyProfileFilter {
    pub fn for_family(family_id: FamilyId) -> Self {
        Self {
            family_id: Some(family_id),
            ..Default::default()
        }
    }
}

// Database entity model, with the master profile reference joined in
#[derive(Debug, Clone, FromRow)]
struct FamilyProfileRow {
    id: FamilyProfileId,
    family_id: FamilyId,
    profile_type: String,
    name: String,
    description: Option<String>,
    config: serde_json::Value,
    master_profile_id: Option<MasterProfileId>,
    individual_profile_ref: Option<String>,
    master_profile_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FamilyProfileRow> for FamilyProfileDBResponse {
    type Error = DbError;

    fn try_from(row: FamilyProfileRow) -> Result<Self> {
        let profile_type: ProfileType = row
            .profile_type
            .parse()
            .map_err(|e: String| DbError::Other(anyhow::anyhow!("family profile {}: {e}", row.id)))?;

        let source = match (row.master_profile_id, row.master_profile_ref, row.individual_profile_ref) {
            (Some(master_profile_id), Some(profile_ref), None) => ProfileSource::Master {
                master_profile_id,
                profile_ref,
            },
            (None, _, Some(profile_ref)) => ProfileSource::Individual { profile_ref },
            _ => {
                return Err(DbError::Other(anyhow::anyhow!(
                    "family profile {} has no resolvable external profile",
                    row.id
                )));
            }
        };

        Ok(Self {
            id: row.id,
            family_id: row.family_id,
            profile_type,
            name: row.name,
            description: row.description,
            config: row.config,
            source,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct FamilyProfiles<'c> {
    db: &'c mut PgConnection,
}

impl<'c> FamilyProfiles<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for FamilyProfiles<'c> {
    type CreateRequest = FamilyProfileCreateDBRequest;
    type UpdateRequest = FamilyProfileUpdateDBRequest;
    type Response = FamilyProfileDBResponse;
    type Id = FamilyProfileId;
    type Filter = FamilyProfileFilter;

    #[instrument(skip(self, request), fields(family_id = %abbrev_uuid(&request.family_id), profile_type = %request.profile_type), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let (master_profile_id, individual_profile_ref) = match &request.source {
            NewProfileSource::Master(id) => (Some(*id), None),
            NewProfileSource::Individual(profile_ref) => (None, Some(profile_ref.as_str())),
        };

        let row = sqlx::query_as::<_, FamilyProfileRow>(&format!(
            r#"
            WITH fp AS (
                INSERT INTO family_profiles
                    (family_id, profile_type, name, description, config, master_profile_id, individual_profile_ref)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING *
            )
            {SELECT_RESOLVED}
            FROM fp LEFT JOIN master_profiles mp ON mp.id = fp.master_profile_id
            "#
        ))
        .bind(request.family_id)
        .bind(request.profile_type.as_str())
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.config)
        .bind(master_profile_id)
        .bind(individual_profile_ref)
        .fetch_one(&mut *self.db)
        .await?;

        FamilyProfileDBResponse::try_from(row)
    }

    #[instrument(skip(self), fields(family_profile_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let row = sqlx::query_as::<_, FamilyProfileRow>(&format!(
            "{SELECT_RESOLVED} FROM family_profiles fp LEFT JOIN master_profiles mp ON mp.id = fp.master_profile_id WHERE fp.id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?;

        row.map(FamilyProfileDBResponse::try_from).transpose()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<FamilyProfileId>) -> Result<HashMap<FamilyProfileId, FamilyProfileDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, FamilyProfileRow>(&format!(
            "{SELECT_RESOLVED} FROM family_profiles fp LEFT JOIN master_profiles mp ON mp.id = fp.master_profile_id WHERE fp.id = ANY($1)"
        ))
        .bind(ids.as_slice())
        .fetch_all(&mut *self.db)
        .await?;

        rows.into_iter()
            .map(|row| FamilyProfileDBResponse::try_from(row).map(|p| (p.id, p)))
            .collect()
    }

    #[instrument(skip(self, filter), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut query = QueryBuilder::new(format!(
            "{SELECT_RESOLVED} FROM family_profiles fp LEFT JOIN master_profiles mp ON mp.id = fp.master_profile_id WHERE 1=1"
        ));

        if let Some(family_id) = filter.family_id {
            query.push(" AND fp.family_id = ");
            query.push_bind(family_id);
        }
        if let Some(profile_type) = filter.profile_type {
            query.push(" AND fp.profile_type = ");
            query.push_bind(profile_type.as_str());
        }
        if let Some(master_profile_id) = filter.master_profile_id {
            query.push(" AND fp.master_profile_id = ");
            query.push_bind(master_profile_id);
        }

        query.push(" ORDER BY fp.created_at, fp.id");

        let rows = query.build_query_as::<FamilyProfileRow>().fetch_all(&mut *self.db).await?;

        rows.into_iter().map(FamilyProfileDBResponse::try_from).collect()
    }

    #[instrument(skip(self), fields(family_profile_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM family_profiles WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(family_profile_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let row = sqlx::query_as::<_, FamilyProfileRow>(&format!(
            r#"
            WITH fp AS (
                UPDATE family_profiles SET
                    name = COALESCE($2, name),
                    description = COALESCE($3, description),
                    config = COALESCE($4, config),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
            )
            {SELECT_RESOLVED}
            FROM fp LEFT JOIN master_profiles mp ON mp.id = fp.master_profile_id
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(&request.description)
        .bind(&request.config)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        FamilyProfileDBResponse::try_from(row)
    }
}
