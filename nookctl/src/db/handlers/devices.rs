//! Database repository for devices.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::devices::{DeviceCreateDBRequest, DeviceDBResponse, DeviceUpdateDBRequest},
};
use crate::types::{DeviceId, FamilyId, FamilyProfileId, abbrev_uuid};
use sqlx::{PgConnection, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

const DEVICE_COLUMNS: &str = "id, family_id, name, assigned_family_profile_id, external_device_ref, created_at, updated_at";

/// Filter for listing devices
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub family_id: Option<FamilyId>,
    pub assigned_family_profile_id: Option<FamilyProfileId>,
}

impl DeviceFilter {
    pub fn for_family(family_id: FamilyId) -> Self {
        Self {
            family_id: Some(family_id),
            ..Default::default()
        }
    }

    pub fn assigned_to(family_profile_id: FamilyProfileId) -> Self {
        Self {
            assigned_family_profile_id: Some(family_profile_id),
            ..Default::default()
        }
    }
}

pub struct Devices<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Devices<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Set or clear the profile assignment of a device.
    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    pub async fn set_assignment(&mut self, id: DeviceId, family_profile_id: Option<FamilyProfileId>) -> Result<DeviceDBResponse> {
        let device = sqlx::query_as::<_, DeviceDBResponse>(&format!(
            "UPDATE devices SET assigned_family_profile_id = $2, updated_at = NOW() WHERE id = $1 RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(family_profile_id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(device)
    }

    /// Record the MDM identity of a device once it has enrolled.
    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    pub async fn set_external_ref(&mut self, id: DeviceId, external_device_ref: &str) -> Result<DeviceDBResponse> {
        let device = sqlx::query_as::<_, DeviceDBResponse>(&format!(
            "UPDATE devices SET external_device_ref = $2, updated_at = NOW() WHERE id = $1 RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(external_device_ref)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(device)
    }

    /// Clear every assignment pointing at a family profile. Returns the number of devices touched.
    #[instrument(skip(self), fields(family_profile_id = %abbrev_uuid(&family_profile_id)), err)]
    pub async fn clear_assignments_to(&mut self, family_profile_id: FamilyProfileId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE devices SET assigned_family_profile_id = NULL, updated_at = NOW() WHERE assigned_family_profile_id = $1",
        )
        .bind(family_profile_id)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Devices<'c> {
    type CreateRequest = DeviceCreateDBRequest;
    type UpdateRequest = DeviceUpdateDBRequest;
    type Response = DeviceDBResponse;
    type Id = DeviceId;
    type Filter = DeviceFilter;

    #[instrument(skip(self, request), fields(family_id = %abbrev_uuid(&request.family_id)), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let device = sqlx::query_as::<_, DeviceDBResponse>(&format!(
            r#"
            INSERT INTO devices (family_id, name, assigned_family_profile_id, external_device_ref)
            VALUES ($1, $2, $3, $4)
            RETURNING {DEVICE_COLUMNS}
            "#
        ))
        .bind(request.family_id)
        .bind(&request.name)
        .bind(request.assigned_family_profile_id)
        .bind(&request.external_device_ref)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(device)
    }

    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let device = sqlx::query_as::<_, DeviceDBResponse>(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(device)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<DeviceId>) -> Result<HashMap<DeviceId, DeviceDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let devices = sqlx::query_as::<_, DeviceDBResponse>(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ANY($1)"))
            .bind(ids.as_slice())
            .fetch_all(&mut *self.db)
            .await?;

        Ok(devices.into_iter().map(|d| (d.id, d)).collect())
    }

    #[instrument(skip(self, filter), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut query = QueryBuilder::new(format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE 1=1"));

        if let Some(family_id) = filter.family_id {
            query.push(" AND family_id = ");
            query.push_bind(family_id);
        }
        if let Some(family_profile_id) = filter.assigned_family_profile_id {
            query.push(" AND assigned_family_profile_id = ");
            query.push_bind(family_profile_id);
        }

        query.push(" ORDER BY created_at, id");

        let devices = query.build_query_as::<DeviceDBResponse>().fetch_all(&mut *self.db).await?;

        Ok(devices)
    }

    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1").bind(id).execute(&mut *self.db).await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(device_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let device = sqlx::query_as::<_, DeviceDBResponse>(&format!(
            "UPDATE devices SET name = COALESCE($2, name), updated_at = NOW() WHERE id = $1 RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(&request.name)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Families;
    use crate::db::models::families::FamilyCreateDBRequest;
    use sqlx::{Acquire, PgPool};
    use uuid::Uuid;

    #[sqlx::test]
    #[test_log::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_device_assignment_round_trip(pool: PgPool) {
        let mut tx = pool.begin().await.unwrap();
        let family = Families::new(tx.acquire().await.unwrap())
            .create(&FamilyCreateDBRequest {
                name: "Novak".to_string(),
                parent_id: Uuid::new_v4(),
                external_group_ref: Some("12".to_string()),
            })
            .await
            .unwrap();

        let mut repo = Devices::new(tx.acquire().await.unwrap());
        let device = repo
            .create(&DeviceCreateDBRequest {
                family_id: family.id,
                name: "Mila's phone".to_string(),
                assigned_family_profile_id: None,
                external_device_ref: None,
            })
            .await
            .unwrap();

        let enrolled = repo.set_external_ref(device.id, "8080").await.unwrap();
        assert_eq!(enrolled.external_device_ref.as_deref(), Some("8080"));

        let listed = repo.list(&DeviceFilter::for_family(family.id)).await.unwrap();
        assert_eq!(listed.len(), 1);

        let missing = repo.set_assignment(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(missing, DbError::NotFound));
    }
}
