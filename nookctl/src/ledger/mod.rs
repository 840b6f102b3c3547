//! The assignment ledger: the local source of truth for families, profiles and devices.
//!
//! The ledger enforces the relational invariants that never depend on the MDM:
//!
//! - a family profile is backed by exactly one source, a master profile for predefined types
//!   and an individual external profile for custom ones
//! - a device can only be assigned a profile belonging to its own family
//! - a master profile cannot be deleted while a family profile uses it
//! - deleting a family profile clears the assignment of every device that pointed at it
//! - an enrollment code identifies at most one family
//!
//! [`PgLedger`] is the production implementation. [`memory::InMemoryLedger`] mirrors its
//! behaviour for coordinator and HTTP tests.

use crate::db::errors::DbError;
use crate::db::models::{
    devices::{DeviceCreateDBRequest, DeviceDBResponse},
    enrollment_codes::{EnrollmentCodeCreateDBRequest, EnrollmentCodeDBResponse},
    families::{FamilyCreateDBRequest, FamilyDBResponse},
    family_profiles::{FamilyProfileCreateDBRequest, FamilyProfileDBResponse, FamilyProfileUpdateDBRequest, NewProfileSource},
    master_profiles::{MasterProfileCreateDBRequest, MasterProfileDBResponse},
};
use crate::types::{DeviceId, FamilyId, FamilyProfileId, MasterProfileId, ProfileType, UserId};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod postgres;

pub use postgres::PgLedger;

/// Errors raised by ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("family profile {profile_id} does not belong to family {family_id}")]
    CrossFamilyProfile { family_id: FamilyId, profile_id: FamilyProfileId },

    #[error("invalid profile source: {0}")]
    InvalidProfileSource(String),

    #[error("family {family_id} already has a {profile_type} profile")]
    DuplicateProfileType { family_id: FamilyId, profile_type: ProfileType },

    #[error("a master profile for {0} already exists")]
    MasterProfileExists(ProfileType),

    #[error("master profile {id} is still used by {references} family profile(s)")]
    MasterProfileInUse { id: MasterProfileId, references: i64 },

    #[error("enrollment code is already in use")]
    DuplicateEnrollmentCode,

    #[error(transparent)]
    Db(#[from] DbError),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Persistent record of families, master profiles, family profiles and device assignments.
#[async_trait]
pub trait AssignmentLedger: Send + Sync {
    async fn create_family(&self, request: FamilyCreateDBRequest) -> Result<FamilyDBResponse>;
    async fn get_family(&self, id: FamilyId) -> Result<Option<FamilyDBResponse>>;
    /// Families owned by `parent_id`, or every family when `None`.
    async fn list_families(&self, parent_id: Option<UserId>) -> Result<Vec<FamilyDBResponse>>;
    async fn rename_family(&self, id: FamilyId, name: &str) -> Result<FamilyDBResponse>;
    async fn set_family_group_ref(&self, id: FamilyId, group_ref: &str) -> Result<FamilyDBResponse>;
    /// Removes the family with its profiles and devices.
    async fn delete_family(&self, id: FamilyId) -> Result<bool>;

    async fn create_master_profile(&self, request: MasterProfileCreateDBRequest) -> Result<MasterProfileDBResponse>;
    async fn get_master_profile(&self, id: MasterProfileId) -> Result<Option<MasterProfileDBResponse>>;
    async fn get_master_profile_by_type(&self, profile_type: ProfileType) -> Result<Option<MasterProfileDBResponse>>;
    async fn list_master_profiles(&self) -> Result<Vec<MasterProfileDBResponse>>;
    /// Fails with [`LedgerError::MasterProfileInUse`] while any family profile references it.
    async fn delete_master_profile(&self, id: MasterProfileId) -> Result<bool>;

    async fn create_family_profile(&self, request: FamilyProfileCreateDBRequest) -> Result<FamilyProfileDBResponse>;
    async fn get_family_profile(&self, id: FamilyProfileId) -> Result<Option<FamilyProfileDBResponse>>;
    async fn list_family_profiles(&self, family_id: FamilyId) -> Result<Vec<FamilyProfileDBResponse>>;
    async fn find_family_profile_by_type(&self, family_id: FamilyId, profile_type: ProfileType) -> Result<Option<FamilyProfileDBResponse>>;
    async fn update_family_profile(&self, id: FamilyProfileId, request: FamilyProfileUpdateDBRequest) -> Result<FamilyProfileDBResponse>;
    /// Deletes the family profile and clears every device assignment to it, atomically.
    /// Returns the number of devices whose assignment was cleared.
    async fn delete_family_profile(&self, id: FamilyProfileId) -> Result<u64>;

    async fn create_device(&self, request: DeviceCreateDBRequest) -> Result<DeviceDBResponse>;
    async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceDBResponse>>;
    async fn list_devices(&self, family_id: FamilyId) -> Result<Vec<DeviceDBResponse>>;
    async fn list_devices_assigned_to(&self, family_profile_id: FamilyProfileId) -> Result<Vec<DeviceDBResponse>>;
    /// Sets or clears a device's profile. A profile from another family is rejected.
    async fn assign_device(&self, id: DeviceId, family_profile_id: Option<FamilyProfileId>) -> Result<DeviceDBResponse>;
    async fn set_device_external_ref(&self, id: DeviceId, external_device_ref: &str) -> Result<DeviceDBResponse>;
    async fn delete_device(&self, id: DeviceId) -> Result<bool>;

    /// Fails with [`LedgerError::DuplicateEnrollmentCode`] when the code is already taken.
    async fn create_enrollment_code(&self, request: EnrollmentCodeCreateDBRequest) -> Result<EnrollmentCodeDBResponse>;
    async fn get_enrollment_code(&self, code: &str) -> Result<Option<EnrollmentCodeDBResponse>>;
    /// Newest first.
    async fn list_enrollment_codes(&self, family_id: FamilyId) -> Result<Vec<EnrollmentCodeDBResponse>>;
}

/// Check that a new family profile's source matches its type.
///
/// `master` is the master profile named by a [`NewProfileSource::Master`] source, if it exists.
pub(crate) fn check_profile_source(
    profile_type: ProfileType,
    source: &NewProfileSource,
    master: Option<&MasterProfileDBResponse>,
) -> Result<()> {
    match (profile_type.is_custom(), source) {
        (true, NewProfileSource::Individual(profile_ref)) => {
            if profile_ref.trim().is_empty() {
                return Err(LedgerError::InvalidProfileSource("individual profile reference is empty".to_string()));
            }
            Ok(())
        }
        (true, NewProfileSource::Master(_)) => Err(LedgerError::InvalidProfileSource(
            "custom profiles must own an individual external profile".to_string(),
        )),
        (false, NewProfileSource::Individual(_)) => Err(LedgerError::InvalidProfileSource(format!(
            "{profile_type} profiles must use the shared master profile"
        ))),
        (false, NewProfileSource::Master(id)) => match master {
            None => Err(LedgerError::NotFound {
                entity: "master profile",
                id: *id,
            }),
            Some(master) if master.profile_type != profile_type => Err(LedgerError::InvalidProfileSource(format!(
                "master profile {} is a {} profile, not {profile_type}",
                master.id, master.profile_type
            ))),
            Some(_) => Ok(()),
        },
    }
}

/// Check that a profile may be assigned to a device of `family_id`.
pub(crate) fn check_same_family(family_id: FamilyId, profile: &FamilyProfileDBResponse) -> Result<()> {
    if profile.family_id != family_id {
        return Err(LedgerError::CrossFamilyProfile {
            family_id,
            profile_id: profile.id,
        });
    }
    Ok(())
}
