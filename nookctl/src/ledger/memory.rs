//! In-memory ledger for tests. Enforces the same invariants as [`super::PgLedger`].

use super::{AssignmentLedger, LedgerError, Result, check_profile_source, check_same_family};
use crate::db::errors::DbError;
use crate::db::models::{
    devices::{DeviceCreateDBRequest, DeviceDBResponse},
    enrollment_codes::{EnrollmentCodeCreateDBRequest, EnrollmentCodeDBResponse},
    families::{FamilyCreateDBRequest, FamilyDBResponse},
    family_profiles::{FamilyProfileCreateDBRequest, FamilyProfileDBResponse, FamilyProfileUpdateDBRequest, NewProfileSource, ProfileSource},
    master_profiles::{MasterProfileCreateDBRequest, MasterProfileDBResponse},
};
use crate::types::{DeviceId, EnrollmentCodeId, FamilyId, FamilyProfileId, MasterProfileId, ProfileType, UserId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    families: HashMap<FamilyId, FamilyDBResponse>,
    masters: HashMap<MasterProfileId, MasterProfileDBResponse>,
    profiles: HashMap<FamilyProfileId, FamilyProfileDBResponse>,
    devices: HashMap<DeviceId, DeviceDBResponse>,
    enrollment_codes: HashMap<EnrollmentCodeId, EnrollmentCodeDBResponse>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<State>,
    failing_writes: AtomicUsize,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write operations fail with a database error.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_write(&self) -> Result<()> {
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Db(DbError::Other(anyhow::anyhow!("injected ledger write failure"))));
        }
        Ok(())
    }
}

fn sorted_by_creation<T, K: Ord>(mut items: Vec<T>, key: impl Fn(&T) -> K) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl AssignmentLedger for InMemoryLedger {
    async fn create_family(&self, request: FamilyCreateDBRequest) -> Result<FamilyDBResponse> {
        self.check_write()?;
        let now = Utc::now();
        let family = FamilyDBResponse {
            id: Uuid::new_v4(),
            name: request.name,
            parent_id: request.parent_id,
            external_group_ref: request.external_group_ref,
            created_at: now,
            updated_at: now,
        };
        self.state().families.insert(family.id, family.clone());
        Ok(family)
    }

    async fn get_family(&self, id: FamilyId) -> Result<Option<FamilyDBResponse>> {
        Ok(self.state().families.get(&id).cloned())
    }

    async fn list_families(&self, parent_id: Option<UserId>) -> Result<Vec<FamilyDBResponse>> {
        let families = self
            .state()
            .families
            .values()
            .filter(|f| parent_id.is_none_or(|p| f.parent_id == p))
            .cloned()
            .collect();
        Ok(sorted_by_creation(families, |f| (f.created_at, f.id)))
    }

    async fn rename_family(&self, id: FamilyId, name: &str) -> Result<FamilyDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        let family = state.families.get_mut(&id).ok_or(LedgerError::NotFound { entity: "family", id })?;
        family.name = name.to_string();
        family.updated_at = Utc::now();
        Ok(family.clone())
    }

    async fn set_family_group_ref(&self, id: FamilyId, group_ref: &str) -> Result<FamilyDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        let family = state.families.get_mut(&id).ok_or(LedgerError::NotFound { entity: "family", id })?;
        family.external_group_ref = Some(group_ref.to_string());
        family.updated_at = Utc::now();
        Ok(family.clone())
    }

    async fn delete_family(&self, id: FamilyId) -> Result<bool> {
        self.check_write()?;
        let mut state = self.state();
        if state.families.remove(&id).is_none() {
            return Ok(false);
        }
        state.profiles.retain(|_, p| p.family_id != id);
        state.devices.retain(|_, d| d.family_id != id);
        state.enrollment_codes.retain(|_, c| c.family_id != id);
        Ok(true)
    }

    async fn create_master_profile(&self, request: MasterProfileCreateDBRequest) -> Result<MasterProfileDBResponse> {
        self.check_write()?;
        if request.profile_type.is_custom() {
            return Err(LedgerError::InvalidProfileSource("custom profiles have no master profile".to_string()));
        }
        let mut state = self.state();
        if state.masters.values().any(|m| m.profile_type == request.profile_type) {
            return Err(LedgerError::MasterProfileExists(request.profile_type));
        }
        let master = MasterProfileDBResponse {
            id: Uuid::new_v4(),
            profile_type: request.profile_type,
            name: request.name,
            description: request.description,
            external_profile_ref: request.external_profile_ref,
            created_at: Utc::now(),
        };
        state.masters.insert(master.id, master.clone());
        Ok(master)
    }

    async fn get_master_profile(&self, id: MasterProfileId) -> Result<Option<MasterProfileDBResponse>> {
        Ok(self.state().masters.get(&id).cloned())
    }

    async fn get_master_profile_by_type(&self, profile_type: ProfileType) -> Result<Option<MasterProfileDBResponse>> {
        Ok(self.state().masters.values().find(|m| m.profile_type == profile_type).cloned())
    }

    async fn list_master_profiles(&self) -> Result<Vec<MasterProfileDBResponse>> {
        let masters = self.state().masters.values().cloned().collect();
        Ok(sorted_by_creation(masters, |m| (m.created_at, m.id)))
    }

    async fn delete_master_profile(&self, id: MasterProfileId) -> Result<bool> {
        self.check_write()?;
        let mut state = self.state();
        let references = state.profiles.values().filter(|p| p.master_profile_id() == Some(id)).count() as i64;
        if references > 0 {
            return Err(LedgerError::MasterProfileInUse { id, references });
        }
        Ok(state.masters.remove(&id).is_some())
    }

    async fn create_family_profile(&self, request: FamilyProfileCreateDBRequest) -> Result<FamilyProfileDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        if !state.families.contains_key(&request.family_id) {
            return Err(LedgerError::NotFound {
                entity: "family",
                id: request.family_id,
            });
        }

        let master = match &request.source {
            NewProfileSource::Master(id) => state.masters.get(id).cloned(),
            NewProfileSource::Individual(_) => None,
        };
        check_profile_source(request.profile_type, &request.source, master.as_ref())?;

        if !request.profile_type.is_custom()
            && state
                .profiles
                .values()
                .any(|p| p.family_id == request.family_id && p.profile_type == request.profile_type)
        {
            return Err(LedgerError::DuplicateProfileType {
                family_id: request.family_id,
                profile_type: request.profile_type,
            });
        }

        let source = match (request.source, master) {
            (NewProfileSource::Master(master_profile_id), Some(master)) => ProfileSource::Master {
                master_profile_id,
                profile_ref: master.external_profile_ref,
            },
            (NewProfileSource::Individual(profile_ref), _) => ProfileSource::Individual { profile_ref },
            (NewProfileSource::Master(id), None) => return Err(LedgerError::NotFound { entity: "master profile", id }),
        };

        let now = Utc::now();
        let profile = FamilyProfileDBResponse {
            id: Uuid::new_v4(),
            family_id: request.family_id,
            profile_type: request.profile_type,
            name: request.name,
            description: request.description,
            config: request.config,
            source,
            created_at: now,
            updated_at: now,
        };
        state.profiles.insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn get_family_profile(&self, id: FamilyProfileId) -> Result<Option<FamilyProfileDBResponse>> {
        Ok(self.state().profiles.get(&id).cloned())
    }

    async fn list_family_profiles(&self, family_id: FamilyId) -> Result<Vec<FamilyProfileDBResponse>> {
        let profiles = self.state().profiles.values().filter(|p| p.family_id == family_id).cloned().collect();
        Ok(sorted_by_creation(profiles, |p| (p.created_at, p.id)))
    }

    async fn find_family_profile_by_type(&self, family_id: FamilyId, profile_type: ProfileType) -> Result<Option<FamilyProfileDBResponse>> {
        let profiles = self.list_family_profiles(family_id).await?;
        Ok(profiles.into_iter().find(|p| p.profile_type == profile_type))
    }

    async fn update_family_profile(&self, id: FamilyProfileId, request: FamilyProfileUpdateDBRequest) -> Result<FamilyProfileDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        let profile = state
            .profiles
            .get_mut(&id)
            .ok_or(LedgerError::NotFound { entity: "family profile", id })?;
        if let Some(name) = request.name {
            profile.name = name;
        }
        if let Some(description) = request.description {
            profile.description = Some(description);
        }
        if let Some(config) = request.config {
            profile.config = config;
        }
        profile.updated_at = Utc::now();
        Ok(profile.clone())
    }

    async fn delete_family_profile(&self, id: FamilyProfileId) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state();
        if state.profiles.remove(&id).is_none() {
            return Err(LedgerError::NotFound { entity: "family profile", id });
        }
        let mut cleared = 0;
        for device in state.devices.values_mut() {
            if device.assigned_family_profile_id == Some(id) {
                device.assigned_family_profile_id = None;
                device.updated_at = Utc::now();
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn create_device(&self, request: DeviceCreateDBRequest) -> Result<DeviceDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        if !state.families.contains_key(&request.family_id) {
            return Err(LedgerError::NotFound {
                entity: "family",
                id: request.family_id,
            });
        }
        if let Some(profile_id) = request.assigned_family_profile_id {
            let profile = state.profiles.get(&profile_id).ok_or(LedgerError::NotFound {
                entity: "family profile",
                id: profile_id,
            })?;
            check_same_family(request.family_id, profile)?;
        }
        let now = Utc::now();
        let device = DeviceDBResponse {
            id: Uuid::new_v4(),
            family_id: request.family_id,
            name: request.name,
            assigned_family_profile_id: request.assigned_family_profile_id,
            external_device_ref: request.external_device_ref,
            created_at: now,
            updated_at: now,
        };
        state.devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<DeviceDBResponse>> {
        Ok(self.state().devices.get(&id).cloned())
    }

    async fn list_devices(&self, family_id: FamilyId) -> Result<Vec<DeviceDBResponse>> {
        let devices = self.state().devices.values().filter(|d| d.family_id == family_id).cloned().collect();
        Ok(sorted_by_creation(devices, |d| (d.created_at, d.id)))
    }

    async fn list_devices_assigned_to(&self, family_profile_id: FamilyProfileId) -> Result<Vec<DeviceDBResponse>> {
        let devices = self
            .state()
            .devices
            .values()
            .filter(|d| d.assigned_family_profile_id == Some(family_profile_id))
            .cloned()
            .collect();
        Ok(sorted_by_creation(devices, |d| (d.created_at, d.id)))
    }

    async fn assign_device(&self, id: DeviceId, family_profile_id: Option<FamilyProfileId>) -> Result<DeviceDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        let family_id = state
            .devices
            .get(&id)
            .map(|d| d.family_id)
            .ok_or(LedgerError::NotFound { entity: "device", id })?;
        if let Some(profile_id) = family_profile_id {
            let profile = state.profiles.get(&profile_id).ok_or(LedgerError::NotFound {
                entity: "family profile",
                id: profile_id,
            })?;
            check_same_family(family_id, profile)?;
        }
        let device = state.devices.get_mut(&id).ok_or(LedgerError::NotFound { entity: "device", id })?;
        device.assigned_family_profile_id = family_profile_id;
        device.updated_at = Utc::now();
        Ok(device.clone())
    }

    async fn set_device_external_ref(&self, id: DeviceId, external_device_ref: &str) -> Result<DeviceDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        if state
            .devices
            .values()
            .any(|d| d.id != id && d.external_device_ref.as_deref() == Some(external_device_ref))
        {
            return Err(LedgerError::Db(DbError::UniqueViolation {
                constraint: Some("devices_external_device_ref_unique".to_string()),
                table: Some("devices".to_string()),
                message: format!("external device reference {external_device_ref} is already recorded"),
            }));
        }
        let device = state.devices.get_mut(&id).ok_or(LedgerError::NotFound { entity: "device", id })?;
        device.external_device_ref = Some(external_device_ref.to_string());
        device.updated_at = Utc::now();
        Ok(device.clone())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<bool> {
        self.check_write()?;
        Ok(self.state().devices.remove(&id).is_some())
    }

    async fn create_enrollment_code(&self, request: EnrollmentCodeCreateDBRequest) -> Result<EnrollmentCodeDBResponse> {
        self.check_write()?;
        let mut state = self.state();
        if !state.families.contains_key(&request.family_id) {
            return Err(LedgerError::NotFound {
                entity: "family",
                id: request.family_id,
            });
        }
        if state.enrollment_codes.values().any(|c| c.code == request.code) {
            return Err(LedgerError::DuplicateEnrollmentCode);
        }
        let code = EnrollmentCodeDBResponse {
            id: Uuid::new_v4(),
            family_id: request.family_id,
            code: request.code,
            external_enrollment_ref: request.external_enrollment_ref,
            enrollment_url: request.enrollment_url,
            expires_at: request.expires_at,
            created_at: Utc::now(),
        };
        state.enrollment_codes.insert(code.id, code.clone());
        Ok(code)
    }

    async fn get_enrollment_code(&self, code: &str) -> Result<Option<EnrollmentCodeDBResponse>> {
        Ok(self.state().enrollment_codes.values().find(|c| c.code == code).cloned())
    }

    async fn list_enrollment_codes(&self, family_id: FamilyId) -> Result<Vec<EnrollmentCodeDBResponse>> {
        let codes = self
            .state()
            .enrollment_codes
            .values()
            .filter(|c| c.family_id == family_id)
            .cloned()
            .collect();
        let mut codes = sorted_by_creation(codes, |c| (c.created_at, c.id));
        codes.reverse();
        Ok(codes)
    }
}
