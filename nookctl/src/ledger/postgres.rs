//! Postgres-backed ledger built on the table repositories.

use super::{AssignmentLedger, LedgerError, Result, check_profile_source, check_same_family};
use crate::db::errors::DbError;
use crate::db::handlers::{
    Devices, EnrollmentCodes, Families, FamilyProfiles, MasterProfiles, Repository,
    devices::DeviceFilter,
    enrollment_codes::ENROLLMENT_CODE_UNIQUE,
    families::FamilyFilter,
    family_profiles::{FAMILY_PREDEFINED_TYPE_UNIQUE, FamilyProfileFilter},
    master_profiles::{MASTER_PROFILE_TYPE_UNIQUE, MasterProfileFilter},
};
use crate::db::models::{
    devices::{DeviceCreateDBRequest, DeviceDBResponse},
    enrollment_codes::{EnrollmentCodeCreateDBRequest, EnrollmentCodeDBResponse},
    families::{FamilyCreateDBRequest, FamilyDBResponse, FamilyUpdateDBRequest},
    family_profiles::{FamilyProfileCreateDBRequest, FamilyProfileDBResponse, FamilyProfileUpdateDBRequest, NewProfileSource},
    master_profiles::{MasterProfileCreateDBRequest, MasterProfileDBResponse},
};
use crate::types::{DeviceId, FamilyId, FamilyProfileId, MasterProfileId, ProfileType, UserId, abbrev_uuid};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};

// Large enough to return every family of one parent in a single page.
const FAMILY_PAGE_LIMIT: i64 = 10_000;

#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db<E: Into<DbError>>(err: E) -> LedgerError {
    LedgerError::Db(err.into())
}

#[async_trait]
impl AssignmentLedger for PgLedger {
    async fn create_family(&self, request: FamilyCreateDBRequest) -> Result<FamilyDBResponse> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(Families::new(&mut conn).create(&request).await?)
    }

    async fn get_family(&self, id: FamilyId) -> Result<Option<FamilyDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(Families::new(&mut conn).get_by_id(id).await?)
    }

    async fn list_families(&self, parent_id: Option<UserId>) -> Result<Vec<FamilyDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        let mut filter = FamilyFilter::new(0, FAMILY_PAGE_LIMIT);
        if let Some(parent_id) = parent_id {
            filter = filter.with_parent(parent_id);
        }
        Ok(Families::new(&mut conn).list(&filter).await?)
    }

    async fn rename_family(&self, id: FamilyId, name: &str) -> Result<FamilyDBResponse> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        let request = FamilyUpdateDBRequest {
            name: Some(name.to_string()),
            ..Default::default()
        };
        Families::new(&mut conn).update(id, &request).await.map_err(|e| not_found(e, "family", id))
    }

    async fn set_family_group_ref(&self, id: FamilyId, group_ref: &str) -> Result<FamilyDBResponse> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        let request = FamilyUpdateDBRequest {
            external_group_ref: Some(group_ref.to_string()),
            ..Default::default()
        };
        Families::new(&mut conn).update(id, &request).await.map_err(|e| not_found(e, "family", id))
    }

    async fn delete_family(&self, id: FamilyId) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(Families::new(&mut conn).delete(id).await?)
    }

    async fn create_master_profile(&self, request: MasterProfileCreateDBRequest) -> Result<MasterProfileDBResponse> {
        if request.profile_type.is_custom() {
            return Err(LedgerError::InvalidProfileSource("custom profiles have no master profile".to_string()));
        }
        let mut conn = self.pool.acquire().await.map_err(db)?;
        MasterProfiles::new(&mut conn).create(&request).await.map_err(|e| {
            if e.is_unique_violation_on(MASTER_PROFILE_TYPE_UNIQUE) {
                LedgerError::MasterProfileExists(request.profile_type)
            } else {
                LedgerError::Db(e)
            }
        })
    }

    async fn get_master_profile(&self, id: MasterProfileId) -> Result<Option<MasterProfileDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(MasterProfiles::new(&mut conn).get_by_id(id).await?)
    }

    async fn get_master_profile_by_type(&self, profile_type: ProfileType) -> Result<Option<MasterProfileDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(MasterProfiles::new(&mut conn).get_by_type(profile_type).await?)
    }

    async fn list_master_profiles(&self) -> Result<Vec<MasterProfileDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(MasterProfiles::new(&mut conn).list(&MasterProfileFilter::default()).await?)
    }

    #[instrument(skip(self), fields(master_profile_id = %abbrev_uuid(&id)), err)]
    async fn delete_master_profile(&self, id: MasterProfileId) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        let mut repo = MasterProfiles::new(&mut conn);
        match repo.delete(id).await {
            Ok(deleted) => Ok(deleted),
            // Referenced, either by the pre-check or by the FK on a concurrent insert
            Err(DbError::ProtectedEntity { .. }) | Err(DbError::ForeignKeyViolation { .. }) => {
                let references = repo.count_references(id).await?;
                Err(LedgerError::MasterProfileInUse { id, references })
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, request), fields(family_id = %abbrev_uuid(&request.family_id), profile_type = %request.profile_type), err)]
    async fn create_family_profile(&self, request: FamilyProfileCreateDBRequest) -> Result<FamilyProfileDBResponse> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        if Families::new(&mut tx).get_by_id(request.family_id).await?.is_none() {
            return Err(LedgerError::NotFound {
                entity: "family",
                id: request.family_id,
            });
        }

        let master = match &request.source {
            NewProfileSource::Master(id) => MasterProfiles::new(&mut tx).get_by_id(*id).await?,
            NewProfileSource::Individual(_) => None,
        };
        check_profile_source(request.profile_type, &request.source, master.as_ref())?;

        let profile = FamilyProfiles::new(&mut tx).create(&request).await.map_err(|e| {
            if e.is_unique_violation_on(FAMILY_PREDEFINED_TYPE_UNIQUE) {
                LedgerError::DuplicateProfileType {
                    family_id: request.family_id,
                    profile_type: request.profile_type,
                }
            } else {
                LedgerError::Db(e)
            }
        })?;

        tx.commit().await.map_err(db)?;
        Ok(profile)
    }

    async fn get_family_profile(&self, id: FamilyProfileId) -> Result<Option<FamilyProfileDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(FamilyProfiles::new(&mut conn).get_by_id(id).await?)
    }

    async fn list_family_profiles(&self, family_id: FamilyId) -> Result<Vec<FamilyProfileDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(FamilyProfiles::new(&mut conn).list(&FamilyProfileFilter::for_family(family_id)).await?)
    }

    async fn find_family_profile_by_type(&self, family_id: FamilyId, profile_type: ProfileType) -> Result<Option<FamilyProfileDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        let filter = FamilyProfileFilter {
            family_id: Some(family_id),
            profile_type: Some(profile_type),
            ..Default::default()
        };
        Ok(FamilyProfiles::new(&mut conn).list(&filter).await?.into_iter().next())
    }

    async fn update_family_profile(&self, id: FamilyProfileId, request: FamilyProfileUpdateDBRequest) -> Result<FamilyProfileDBResponse> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        FamilyProfiles::new(&mut conn)
            .update(id, &request)
            .await
            .map_err(|e| not_found(e, "family profile", id))
    }

    #[instrument(skip(self), fields(family_profile_id = %abbrev_uuid(&id)), err)]
    async fn delete_family_profile(&self, id: FamilyProfileId) -> Result<u64> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let cleared = Devices::new(&mut tx).clear_assignments_to(id).await?;
        if !FamilyProfiles::new(&mut tx).delete(id).await? {
            return Err(LedgerError::NotFound {
                entity: "family profile",
                id,
            });
        }

        tx.commit().await.map_err(db)?;
        debug!(cleared, "Deleted family profile and cleared device assignments");
        Ok(cleared)
    }

    async fn create_device(&self, request: DeviceCreateDBRequest) -> Result<DeviceDBResponse> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        if Families::new(&mut tx).get_by_id(request.family_id).await?.is_none() {
            return Err(LedgerError::NotFound {
                entity: "family",
                id: request.family_id,
            });
        }
        if let Some(profile_id) = request.assigned_family_profile_id {
            let profile = FamilyProfiles::new(&mut tx).get_by_id(profile_id).await?.ok_or(LedgerError::NotFound {
                entity: "family profile",
                id: profile_id,
            })?;
            check_same_family(request.family_id, &profile)?;
        }

        let device = Devices::new(&mut tx).create(&request).await?;
        tx.commit().await.map_err(db)?;
        Ok(device)
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(Devices::new(&mut conn).get_by_id(id).await?)
    }

    async fn list_devices(&self, family_id: FamilyId) -> Result<Vec<DeviceDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(Devices::new(&mut conn).list(&DeviceFilter::for_family(family_id)).await?)
    }

    async fn list_devices_assigned_to(&self, family_profile_id: FamilyProfileId) -> Result<Vec<DeviceDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(Devices::new(&mut conn).list(&DeviceFilter::assigned_to(family_profile_id)).await?)
    }

    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    async fn assign_device(&self, id: DeviceId, family_profile_id: Option<FamilyProfileId>) -> Result<DeviceDBResponse> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        let device = Devices::new(&mut tx)
            .get_by_id(id)
            .await?
            .ok_or(LedgerError::NotFound { entity: "device", id })?;
        if let Some(profile_id) = family_profile_id {
            let profile = FamilyProfiles::new(&mut tx).get_by_id(profile_id).await?.ok_or(LedgerError::NotFound {
                entity: "family profile",
                id: profile_id,
            })?;
            check_same_family(device.family_id, &profile)?;
        }

        let device = Devices::new(&mut tx).set_assignment(id, family_profile_id).await?;
        tx.commit().await.map_err(db)?;
        Ok(device)
    }

    async fn set_device_external_ref(&self, id: DeviceId, external_device_ref: &str) -> Result<DeviceDBResponse> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Devices::new(&mut conn)
            .set_external_ref(id, external_device_ref)
            .await
            .map_err(|e| not_found(e, "device", id))
    }

    async fn delete_device(&self, id: DeviceId) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(Devices::new(&mut conn).delete(id).await?)
    }

    async fn create_enrollment_code(&self, request: EnrollmentCodeCreateDBRequest) -> Result<EnrollmentCodeDBResponse> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        if Families::new(&mut tx).get_by_id(request.family_id).await?.is_none() {
            return Err(LedgerError::NotFound {
                entity: "family",
                id: request.family_id,
            });
        }
        let code = EnrollmentCodes::new(&mut tx).create(&request).await.map_err(|e| {
            if e.is_unique_violation_on(ENROLLMENT_CODE_UNIQUE) {
                LedgerError::DuplicateEnrollmentCode
            } else {
                LedgerError::Db(e)
            }
        })?;
        tx.commit().await.map_err(db)?;
        Ok(code)
    }

    async fn get_enrollment_code(&self, code: &str) -> Result<Option<EnrollmentCodeDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(EnrollmentCodes::new(&mut conn).get_by_code(code).await?)
    }

    async fn list_enrollment_codes(&self, family_id: FamilyId) -> Result<Vec<EnrollmentCodeDBResponse>> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        Ok(EnrollmentCodes::new(&mut conn).list_for_family(family_id).await?)
    }
}

fn not_found(err: DbError, entity: &'static str, id: uuid::Uuid) -> LedgerError {
    match err {
        DbError::NotFound => LedgerError::NotFound { entity, id },
        other => LedgerError::Db(other),
    }
}
