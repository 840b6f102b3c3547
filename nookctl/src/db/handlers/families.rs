//! Database repository for families.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::families::{FamilyCreateDBRequest, FamilyDBResponse, FamilyUpdateDBRequest},
};
use crate::types::{FamilyId, UserId, abbrev_uuid};
use sqlx::{PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

const FAMILY_COLUMNS: &str = "id, name, parent_id, external_group_ref, created_at, updated_at";

/// Filter for listing families
#[derive(Debug, Clone)]
pub struct FamilyFilter {
    pub skip: i64,
    pub limit: i64,
    pub parent_id: Option<UserId>,
}

impl FamilyFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self { skip, limit, parent_id: None }
    }

    pub fn with_parent(mut self, parent_id: UserId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}

pub struct Families<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Families<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Families<'c> {
    type CreateRequest = FamilyCreateDBRequest;
    type UpdateRequest = FamilyUpdateDBRequest;
    type Response = FamilyDBResponse;
    type Id = FamilyId;
    type Filter = FamilyFilter;

    #[instrument(skip(self, request), fields(name = %request.name, parent_id = %abbrev_uuid(&request.parent_id)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let family = sqlx::query_as::<_, FamilyDBResponse>(&format!(
            "INSERT INTO families (name, parent_id, external_group_ref) VALUES ($1, $2, $3) RETURNING {FAMILY_COLUMNS}"
        ))
        .bind(&request.name)
        .bind(request.parent_id)
        .bind(&request.external_group_ref)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(family)
    }

    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let family = sqlx::query_as::<_, FamilyDBResponse>(&format!("SELECT {FAMILY_COLUMNS} FROM families WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(family)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<FamilyId>) -> Result<HashMap<FamilyId, FamilyDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let families = sqlx::query_as::<_, FamilyDBResponse>(&format!("SELECT {FAMILY_COLUMNS} FROM families WHERE id = ANY($1)"))
            .bind(ids.as_slice())
            .fetch_all(&mut *self.db)
            .await?;

        Ok(families.into_iter().map(|f| (f.id, f)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut query = QueryBuilder::new(format!("SELECT {FAMILY_COLUMNS} FROM families WHERE 1=1"));

        if let Some(parent_id) = filter.parent_id {
            query.push(" AND parent_id = ");
            query.push_bind(parent_id);
        }

        query.push(" ORDER BY created_at, id LIMIT ");
        query.push_bind(filter.limit);
        query.push(" OFFSET ");
        query.push_bind(filter.skip);

        let families = query.build_query_as::<FamilyDBResponse>().fetch_all(&mut *self.db).await?;

        Ok(families)
    }

    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM families WHERE id = $1").bind(id).execute(&mut *self.db).await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(family_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let family = sqlx::query_as::<_, FamilyDBResponse>(&format!(
            r#"
            UPDATE families SET
                name = COALESCE($2, name),
                external_group_ref = COALESCE($3, external_group_ref),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {FAMILY_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(&request.external_group_ref)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(family)
    }
}
