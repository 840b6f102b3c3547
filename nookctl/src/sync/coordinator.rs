use super::error::{Result, SyncError};
use super::reports::{
    BootstrapFailure, BootstrapReport, BulkFailure, BulkReport, DeleteOutcome, Discrepancy, DiscrepancyKind, RepairReport, RepairResult,
    SyncReport,
};
use crate::content::{CustomProfileConfig, GLOBAL_FAMILY_NAME, ProfileContentGenerator};
use crate::db::models::{
    devices::{DeviceCreateDBRequest, DeviceDBResponse},
    enrollment_codes::{EnrollmentCodeCreateDBRequest, EnrollmentCodeDBResponse},
    families::{FamilyCreateDBRequest, FamilyDBResponse},
    family_profiles::{FamilyProfileCreateDBRequest, FamilyProfileDBResponse, FamilyProfileUpdateDBRequest, NewProfileSource},
    master_profiles::{MasterProfileCreateDBRequest, MasterProfileDBResponse},
};
use crate::ledger::{AssignmentLedger, LedgerError, check_same_family};
use crate::mdm::{ExternalServiceError, MdmClient};
use crate::types::{DeviceId, FamilyId, FamilyProfileId, MasterProfileId, ProfileType, UserId, abbrev_uuid};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use rand::prelude::RngExt;
use rand::rng;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

const DEFAULT_BULK_CONCURRENCY: usize = 4;

/// How long an issued enrollment code stays valid
const ENROLLMENT_CODE_TTL_HOURS: i64 = 24;
/// Fresh codes drawn before giving up on collisions
const ENROLLMENT_CODE_ATTEMPTS: usize = 5;

/// Shown on the lock screen when the parent gives no message
pub const DEFAULT_LOCK_MESSAGE: &str = "Device locked by Nook";

/// Request to add a profile to a family.
#[derive(Debug, Clone)]
pub struct AssignProfile {
    pub profile_type: ProfileType,
    /// Defaults to the type's display name
    pub name: Option<String>,
    pub description: Option<String>,
    /// Required for custom profiles, rejected for predefined ones
    pub config: Option<CustomProfileConfig>,
}

/// Changes to an existing family profile. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<CustomProfileConfig>,
}

/// Orchestrates every assignment mutation across the ledger and the MDM.
///
/// Creates are external-first: a ledger row is written only after the MDM confirmed the link it
/// stands for. Deletes clean up externally first but never let an MDM failure block the local
/// delete. Mutations on one family are serialized by a per-family lock; different families
/// proceed in parallel.
pub struct SyncCoordinator {
    ledger: Arc<dyn AssignmentLedger>,
    mdm: Arc<dyn MdmClient>,
    content: Arc<dyn ProfileContentGenerator>,
    family_locks: DashMap<FamilyId, Arc<Mutex<()>>>,
    bulk_concurrency: usize,
}

fn require_name(name: &str, what: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(SyncError::Validation(format!("{what} name must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn group_ref(family: &FamilyDBResponse) -> Result<&str> {
    family
        .external_group_ref
        .as_deref()
        .ok_or(SyncError::MissingGroupReference(family.id))
}

/// A random six digit code.
fn generate_enrollment_code() -> String {
    rng().random_range(100_000..1_000_000).to_string()
}

fn is_enrollment_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit())
}

fn config_to_json(config: &CustomProfileConfig) -> Result<serde_json::Value> {
    serde_json::to_value(config).map_err(|e| SyncError::Validation(format!("invalid profile configuration: {e}")))
}

impl SyncCoordinator {
    pub fn new(ledger: Arc<dyn AssignmentLedger>, mdm: Arc<dyn MdmClient>, content: Arc<dyn ProfileContentGenerator>) -> Self {
        Self {
            ledger,
            mdm,
            content,
            family_locks: DashMap::new(),
            bulk_concurrency: DEFAULT_BULK_CONCURRENCY,
        }
    }

    /// Number of families a bulk sync works on at once.
    pub fn with_bulk_concurrency(mut self, bulk_concurrency: usize) -> Self {
        self.bulk_concurrency = bulk_concurrency.max(1);
        self
    }

    async fn lock_family(&self, family_id: FamilyId) -> OwnedMutexGuard<()> {
        let lock = self.family_locks.entry(family_id).or_default().clone();
        lock.lock_owned().await
    }

    async fn load_family(&self, id: FamilyId) -> Result<FamilyDBResponse> {
        self.ledger
            .get_family(id)
            .await?
            .ok_or(SyncError::NotFound { entity: "family", id })
    }

    async fn load_family_profile(&self, id: FamilyProfileId) -> Result<FamilyProfileDBResponse> {
        self.ledger
            .get_family_profile(id)
            .await?
            .ok_or(SyncError::NotFound {
                entity: "family profile",
                id,
            })
    }

    async fn load_device(&self, id: DeviceId) -> Result<DeviceDBResponse> {
        self.ledger
            .get_device(id)
            .await?
            .ok_or(SyncError::NotFound { entity: "device", id })
    }

    // ----- reads -----

    pub async fn get_family(&self, id: FamilyId) -> Result<FamilyDBResponse> {
        self.load_family(id).await
    }

    pub async fn list_families(&self, parent_id: Option<UserId>) -> Result<Vec<FamilyDBResponse>> {
        Ok(self.ledger.list_families(parent_id).await?)
    }

    pub async fn get_family_profile(&self, id: FamilyProfileId) -> Result<FamilyProfileDBResponse> {
        self.load_family_profile(id).await
    }

    pub async fn list_family_profiles(&self, family_id: FamilyId) -> Result<Vec<FamilyProfileDBResponse>> {
        self.load_family(family_id).await?;
        Ok(self.ledger.list_family_profiles(family_id).await?)
    }

    pub async fn get_device(&self, id: DeviceId) -> Result<DeviceDBResponse> {
        self.load_device(id).await
    }

    pub async fn list_devices(&self, family_id: FamilyId) -> Result<Vec<DeviceDBResponse>> {
        self.load_family(family_id).await?;
        Ok(self.ledger.list_devices(family_id).await?)
    }

    pub async fn get_master_profile(&self, id: MasterProfileId) -> Result<MasterProfileDBResponse> {
        self.ledger
            .get_master_profile(id)
            .await?
            .ok_or(SyncError::NotFound {
                entity: "master profile",
                id,
            })
    }

    // ----- families -----

    /// Provision a device group, then record the family against it.
    #[instrument(skip(self), fields(parent_id = %abbrev_uuid(&parent_id)), err)]
    pub async fn create_family(&self, parent_id: UserId, name: &str) -> Result<FamilyDBResponse> {
        let name = require_name(name, "family")?;
        let group = self.mdm.create_group(&name).await.map_err(SyncError::external)?;

        let request = FamilyCreateDBRequest {
            name,
            parent_id,
            external_group_ref: Some(group.clone()),
        };
        match self.ledger.create_family(request).await {
            Ok(family) => {
                info!(family_id = %abbrev_uuid(&family.id), group_ref = %group, "Created family");
                Ok(family)
            }
            Err(e) => {
                if let Err(cleanup) = self.mdm.delete_group(&group).await {
                    error!(group_ref = %group, error = %cleanup, "Failed to remove device group after ledger insert failed");
                    metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
                }
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&id)), err)]
    pub async fn rename_family(&self, id: FamilyId, name: &str) -> Result<FamilyDBResponse> {
        let name = require_name(name, "family")?;
        let _guard = self.lock_family(id).await;
        let family = self.load_family(id).await?;
        if let Some(group) = family.external_group_ref.as_deref() {
            self.mdm.rename_group(group, &name).await.map_err(SyncError::external)?;
        }
        Ok(self.ledger.rename_family(id, &name).await?)
    }

    /// Create a device group for a family that has none and record it. Caller holds the family lock.
    async fn provision_group(&self, family: &FamilyDBResponse) -> Result<FamilyDBResponse> {
        let group = self.mdm.create_group(&family.name).await.map_err(SyncError::external)?;
        match self.ledger.set_family_group_ref(family.id, &group).await {
            Ok(updated) => {
                info!(family_id = %abbrev_uuid(&family.id), group_ref = %group, "Provisioned missing device group");
                Ok(updated)
            }
            Err(e) => {
                if let Err(cleanup) = self.mdm.delete_group(&group).await {
                    error!(group_ref = %group, error = %cleanup, "Failed to remove device group after ledger update failed");
                    metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
                }
                Err(e.into())
            }
        }
    }

    /// Tear down the family's MDM footprint, then delete it locally with everything it owns.
    ///
    /// Custom profiles are deleted outright; shared master profiles are only unlinked.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&id)), err)]
    pub async fn delete_family(&self, id: FamilyId) -> Result<DeleteOutcome> {
        let guard = self.lock_family(id).await;
        let family = self.load_family(id).await?;
        let profiles = self.ledger.list_family_profiles(id).await?;
        let devices = self.ledger.list_devices(id).await?;
        let enrollment_codes = self.ledger.list_enrollment_codes(id).await?;
        let mut outcome = DeleteOutcome::default();

        for device in &devices {
            let (Some(device_ref), Some(assigned)) = (device.external_device_ref.as_deref(), device.assigned_family_profile_id) else {
                continue;
            };
            let Some(profile) = profiles.iter().find(|p| p.id == assigned && p.is_shared()) else {
                continue;
            };
            if let Err(e) = self.mdm.unlink_profile_from_device(profile.external_profile_ref(), device_ref).await {
                warn!(device_ref, error = %e, "Failed to unlink master profile from device");
                outcome.cleanup_failed(format!("unlinking profile {} from device {device_ref}", profile.external_profile_ref()), &e);
            }
        }

        for profile in &profiles {
            let profile_ref = profile.external_profile_ref();
            if profile.is_shared() {
                let Some(group) = family.external_group_ref.as_deref() else {
                    continue;
                };
                if let Err(e) = self.mdm.unlink_profile_from_group(profile_ref, group).await {
                    warn!(profile_ref, group_ref = group, error = %e, "Failed to unlink master profile from family group");
                    outcome.cleanup_failed(format!("unlinking profile {profile_ref} from group {group}"), &e);
                }
            } else if let Err(e) = self.mdm.delete_profile(profile_ref).await {
                warn!(profile_ref, error = %e, "Failed to delete custom profile");
                outcome.cleanup_failed(format!("deleting profile {profile_ref}"), &e);
            }
        }

        let enrollment_refs: BTreeSet<&str> = enrollment_codes.iter().map(|c| c.external_enrollment_ref.as_str()).collect();
        for enrollment_ref in enrollment_refs {
            if let Err(e) = self.mdm.delete_enrollment(enrollment_ref).await {
                warn!(enrollment_ref, error = %e, "Failed to delete enrollment");
                outcome.cleanup_failed(format!("deleting enrollment {enrollment_ref}"), &e);
            }
        }

        if let Some(group) = family.external_group_ref.as_deref()
            && let Err(e) = self.mdm.delete_group(group).await
        {
            warn!(group_ref = group, error = %e, "Failed to delete device group");
            outcome.cleanup_failed(format!("deleting device group {group}"), &e);
        }

        if !self.ledger.delete_family(id).await? {
            return Err(SyncError::NotFound { entity: "family", id });
        }
        drop(guard);
        self.family_locks.remove(&id);

        info!(
            profiles = profiles.len(),
            devices = devices.len(),
            cleanup_pending = outcome.external_cleanup_pending,
            "Deleted family"
        );
        Ok(outcome)
    }

    // ----- family profiles -----

    /// Add a profile to a family.
    ///
    /// Predefined types link the shared master profile to the family's group. Custom profiles
    /// render and create an individual MDM profile first, and delete it again if linking fails.
    /// The ledger row is written only once the link exists.
    #[instrument(skip(self, request), fields(family_id = %abbrev_uuid(&family_id), profile_type = %request.profile_type), err)]
    pub async fn assign_profile(&self, family_id: FamilyId, request: AssignProfile) -> Result<FamilyProfileDBResponse> {
        let profile_type = request.profile_type;
        let name = match request.name.as_deref() {
            Some(name) => require_name(name, "profile")?,
            None => profile_type.display_name().to_string(),
        };
        let description = request.description.or_else(|| Some(profile_type.default_description().to_string()));
        if !profile_type.is_custom() && request.config.is_some() {
            return Err(SyncError::Validation(format!("{profile_type} profiles do not accept a configuration")));
        }

        let _guard = self.lock_family(family_id).await;
        let family = self.load_family(family_id).await?;
        let group = group_ref(&family)?;

        if profile_type.is_custom() {
            let config = request.config.ok_or_else(|| SyncError::Validation("custom profiles require a configuration".to_string()))?;
            let config_json = config_to_json(&config)?;
            let blob = self.content.render(profile_type, &family.name, Some(&config))?;

            let profile_ref = self
                .mdm
                .create_profile(&name, &blob)
                .await
                .map_err(|source| SyncError::ProfileCreationFailed { source })?;

            if let Err(source) = self.mdm.link_profile_to_group(&profile_ref, group).await {
                let orphan_cleanup = self.discard_profile(&profile_ref).await;
                return Err(SyncError::External { source, orphan_cleanup });
            }

            let create = FamilyProfileCreateDBRequest {
                family_id,
                profile_type,
                name,
                description,
                config: config_json,
                source: NewProfileSource::Individual(profile_ref.clone()),
            };
            match self.ledger.create_family_profile(create).await {
                Ok(profile) => {
                    info!(family_profile_id = %abbrev_uuid(&profile.id), profile_ref = %profile_ref, "Assigned custom profile");
                    Ok(profile)
                }
                Err(e) => {
                    self.discard_profile(&profile_ref).await;
                    Err(e.into())
                }
            }
        } else {
            if self.ledger.find_family_profile_by_type(family_id, profile_type).await?.is_some() {
                return Err(LedgerError::DuplicateProfileType { family_id, profile_type }.into());
            }
            let master = self
                .ledger
                .get_master_profile_by_type(profile_type)
                .await?
                .ok_or(SyncError::NotBootstrapped(profile_type))?;

            // Master links are never compensated: other state may depend on them
            self.mdm
                .link_profile_to_group(&master.external_profile_ref, group)
                .await
                .map_err(SyncError::external)?;

            let create = FamilyProfileCreateDBRequest {
                family_id,
                profile_type,
                name,
                description,
                config: serde_json::json!({}),
                source: NewProfileSource::Master(master.id),
            };
            let profile = self.ledger.create_family_profile(create).await?;
            info!(family_profile_id = %abbrev_uuid(&profile.id), profile_ref = %master.external_profile_ref, "Assigned master profile");
            Ok(profile)
        }
    }

    /// Best-effort delete of a profile this request created. Returns the failure, if any.
    async fn discard_profile(&self, profile_ref: &str) -> Option<ExternalServiceError> {
        match self.mdm.delete_profile(profile_ref).await {
            Ok(()) => {
                debug!(profile_ref, "Removed orphaned profile");
                None
            }
            Err(e) => {
                error!(profile_ref, error = %e, "Failed to remove orphaned profile");
                metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
                Some(e)
            }
        }
    }

    /// Update a family profile. Custom profiles push re-rendered content to the MDM first;
    /// predefined profiles only change locally since their content is shared.
    #[instrument(skip(self, changes), fields(family_profile_id = %abbrev_uuid(&id)), err)]
    pub async fn update_profile(&self, id: FamilyProfileId, changes: ProfileChanges) -> Result<FamilyProfileDBResponse> {
        let name = changes.name.as_deref().map(|n| require_name(n, "profile")).transpose()?;
        let family_id = self.load_family_profile(id).await?.family_id;

        let _guard = self.lock_family(family_id).await;
        let profile = self.load_family_profile(id).await?;
        if !profile.profile_type.is_custom() && changes.config.is_some() {
            return Err(SyncError::Validation(format!(
                "{} profiles use shared content and cannot be reconfigured",
                profile.profile_type
            )));
        }

        let config_json = changes.config.as_ref().map(config_to_json).transpose()?;
        if profile.profile_type.is_custom() && (name.is_some() || changes.config.is_some()) {
            let family = self.load_family(family_id).await?;
            let config = match changes.config {
                Some(config) => config,
                None => serde_json::from_value::<CustomProfileConfig>(profile.config.clone())
                    .map_err(|e| SyncError::Validation(format!("stored profile configuration is unreadable: {e}")))?,
            };
            let blob = self.content.render(profile.profile_type, &family.name, Some(&config))?;
            let new_name = name.as_deref().unwrap_or(&profile.name);
            self.mdm
                .update_profile(profile.external_profile_ref(), new_name, &blob)
                .await
                .map_err(SyncError::external)?;
        }

        let update = FamilyProfileUpdateDBRequest {
            name,
            description: changes.description,
            config: config_json,
        };
        Ok(self.ledger.update_family_profile(id, update).await?)
    }

    /// Remove a profile from its family. Devices that used it end up with no profile.
    #[instrument(skip(self), fields(family_profile_id = %abbrev_uuid(&id)), err)]
    pub async fn unassign_profile(&self, id: FamilyProfileId) -> Result<DeleteOutcome> {
        let family_id = self.load_family_profile(id).await?.family_id;
        let _guard = self.lock_family(family_id).await;
        let profile = self.load_family_profile(id).await?;
        let family = self.load_family(family_id).await?;
        let profile_ref = profile.external_profile_ref();
        let mut outcome = DeleteOutcome::default();

        if profile.is_shared() {
            for device in self.ledger.list_devices_assigned_to(id).await? {
                let Some(device_ref) = device.external_device_ref.as_deref() else {
                    continue;
                };
                if let Err(e) = self.mdm.unlink_profile_from_device(profile_ref, device_ref).await {
                    warn!(profile_ref, device_ref, error = %e, "Failed to unlink master profile from device");
                    outcome.cleanup_failed(format!("unlinking profile {profile_ref} from device {device_ref}"), &e);
                }
            }
            if let Some(group) = family.external_group_ref.as_deref()
                && let Err(e) = self.mdm.unlink_profile_from_group(profile_ref, group).await
            {
                warn!(profile_ref, group_ref = group, error = %e, "Failed to unlink master profile from family group");
                outcome.cleanup_failed(format!("unlinking profile {profile_ref} from group {group}"), &e);
            }
        } else if let Err(e) = self.mdm.delete_profile(profile_ref).await {
            warn!(profile_ref, error = %e, "Failed to delete custom profile");
            outcome.cleanup_failed(format!("deleting profile {profile_ref}"), &e);
        }

        let cleared = self.ledger.delete_family_profile(id).await?;
        info!(devices_cleared = cleared, cleanup_pending = outcome.external_cleanup_pending, "Unassigned profile");
        Ok(outcome)
    }

    // ----- devices -----

    /// Record a device that has not enrolled yet. Nothing exists in the MDM until it does.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn register_device(&self, family_id: FamilyId, name: &str) -> Result<DeviceDBResponse> {
        let name = require_name(name, "device")?;
        self.load_family(family_id).await?;
        let request = DeviceCreateDBRequest {
            family_id,
            name,
            assigned_family_profile_id: None,
            external_device_ref: None,
        };
        Ok(self.ledger.create_device(request).await?)
    }

    /// Attach the MDM's device reference once the device enrolls, pushing its assigned profile.
    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    pub async fn record_enrollment(&self, id: DeviceId, external_device_ref: &str) -> Result<DeviceDBResponse> {
        let external_device_ref = external_device_ref.trim();
        if external_device_ref.is_empty() {
            return Err(SyncError::Validation("external device reference must not be empty".to_string()));
        }
        let family_id = self.load_device(id).await?.family_id;
        let _guard = self.lock_family(family_id).await;
        let device = self.load_device(id).await?;
        if device.external_device_ref.as_deref() == Some(external_device_ref) {
            return Ok(device);
        }

        let profile = match device.assigned_family_profile_id {
            Some(assigned) => Some(self.load_family_profile(assigned).await?),
            None => None,
        };
        if let Some(profile) = &profile {
            self.mdm
                .link_profile_to_device(profile.external_profile_ref(), external_device_ref)
                .await
                .map_err(SyncError::external)?;
        }

        let updated = match self.ledger.set_device_external_ref(id, external_device_ref).await {
            Ok(updated) => updated,
            Err(e) => {
                if let Some(profile) = &profile
                    && let Err(unlink) = self.mdm.unlink_profile_from_device(profile.external_profile_ref(), external_device_ref).await
                {
                    error!(
                        profile_ref = profile.external_profile_ref(),
                        device_ref = external_device_ref,
                        error = %unlink,
                        "Failed to roll back enrollment link"
                    );
                    metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
                }
                return Err(e.into());
            }
        };

        if let Some(profile) = &profile
            && let Some(previous) = device.external_device_ref.as_deref()
            && let Err(e) = self.mdm.unlink_profile_from_device(profile.external_profile_ref(), previous).await
        {
            warn!(previous_ref = previous, error = %e, "Failed to unlink profile from previous enrollment");
            metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
        }
        Ok(updated)
    }

    /// Point a device at another profile of its family, or at none.
    ///
    /// Enrolled devices get the new link before the old one is removed, so the device is never
    /// left unrestricted in between. A failed link leaves the assignment unchanged. A failed
    /// unlink of the old profile is logged and does not block the change.
    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    pub async fn reassign_device(&self, id: DeviceId, family_profile_id: Option<FamilyProfileId>) -> Result<DeviceDBResponse> {
        let family_id = self.load_device(id).await?.family_id;
        let _guard = self.lock_family(family_id).await;
        let device = self.load_device(id).await?;

        if device.assigned_family_profile_id == family_profile_id {
            debug!("Device already has the requested profile");
            return Ok(device);
        }

        let new_profile = match family_profile_id {
            Some(profile_id) => {
                let profile = self.load_family_profile(profile_id).await?;
                check_same_family(device.family_id, &profile)?;
                Some(profile)
            }
            None => None,
        };

        if let Some(device_ref) = device.external_device_ref.as_deref() {
            let old_ref = match device.assigned_family_profile_id {
                Some(old_id) => self
                    .ledger
                    .get_family_profile(old_id)
                    .await?
                    .map(|p| p.external_profile_ref().to_string()),
                None => None,
            };
            let new_ref = new_profile.as_ref().map(|p| p.external_profile_ref().to_string());

            if let Some(new_ref) = new_ref.as_deref() {
                self.mdm
                    .link_profile_to_device(new_ref, device_ref)
                    .await
                    .map_err(SyncError::external)?;
            }
            if let Some(old_ref) = old_ref.as_deref()
                && new_ref.as_deref() != Some(old_ref)
                && let Err(e) = self.mdm.unlink_profile_from_device(old_ref, device_ref).await
            {
                warn!(profile_ref = old_ref, device_ref, error = %e, "Failed to unlink previous profile from device");
                metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
            }
        }

        Ok(self.ledger.assign_device(id, family_profile_id).await?)
    }

    /// Remove a device. With `unenroll` the device is also removed from the MDM; otherwise only
    /// its profile link is dropped.
    #[instrument(skip(self), fields(device_id = %abbrev_uuid(&id)), err)]
    pub async fn delete_device(&self, id: DeviceId, unenroll: bool) -> Result<DeleteOutcome> {
        let family_id = self.load_device(id).await?.family_id;
        let _guard = self.lock_family(family_id).await;
        let device = self.load_device(id).await?;
        let mut outcome = DeleteOutcome::default();

        if let Some(device_ref) = device.external_device_ref.as_deref() {
            if unenroll {
                if let Err(e) = self.mdm.delete_device(device_ref).await {
                    warn!(device_ref, error = %e, "Failed to unenroll device");
                    outcome.cleanup_failed(format!("unenrolling device {device_ref}"), &e);
                }
            } else if let Some(assigned) = device.assigned_family_profile_id
                && let Some(profile) = self.ledger.get_family_profile(assigned).await?
                && let Err(e) = self.mdm.unlink_profile_from_device(profile.external_profile_ref(), device_ref).await
            {
                warn!(device_ref, error = %e, "Failed to unlink profile from device");
                outcome.cleanup_failed(format!("unlinking profile {} from device {device_ref}", profile.external_profile_ref()), &e);
            }
        }

        if !self.ledger.delete_device(id).await? {
            return Err(SyncError::NotFound { entity: "device", id });
        }
        Ok(outcome)
    }

    /// Lock an enrolled device's screen. Nothing is recorded locally.
    #[instrument(skip(self, message), fields(device_id = %abbrev_uuid(&id)), err)]
    pub async fn lock_device(&self, id: DeviceId, message: Option<&str>) -> Result<DeviceDBResponse> {
        let device = self.load_device(id).await?;
        let device_ref = device
            .external_device_ref
            .as_deref()
            .ok_or_else(|| SyncError::Validation("device is not enrolled in the MDM".to_string()))?;
        let message = message.map(str::trim).filter(|m| !m.is_empty()).unwrap_or(DEFAULT_LOCK_MESSAGE);
        self.mdm.lock_device(device_ref, message).await.map_err(SyncError::external)?;
        info!(device_ref, "Locked device");
        Ok(device)
    }

    // ----- enrollment codes -----

    /// Create an MDM enrollment for the family's group and hand out a six digit code for it.
    ///
    /// Codes expire after a day. A collision with an existing code draws a new one.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn issue_enrollment_code(&self, family_id: FamilyId) -> Result<EnrollmentCodeDBResponse> {
        let _guard = self.lock_family(family_id).await;
        let family = self.load_family(family_id).await?;
        let group = group_ref(&family)?;
        let enrollment = self.mdm.create_enrollment(group).await.map_err(SyncError::external)?;
        let expires_at = Utc::now() + Duration::hours(ENROLLMENT_CODE_TTL_HOURS);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = EnrollmentCodeCreateDBRequest {
                family_id,
                code: generate_enrollment_code(),
                external_enrollment_ref: enrollment.enrollment_ref.clone(),
                enrollment_url: enrollment.url.clone(),
                expires_at,
            };
            match self.ledger.create_enrollment_code(request).await {
                Ok(code) => {
                    info!(enrollment_ref = %enrollment.enrollment_ref, %expires_at, "Issued enrollment code");
                    return Ok(code);
                }
                Err(LedgerError::DuplicateEnrollmentCode) if attempt < ENROLLMENT_CODE_ATTEMPTS => {
                    debug!(attempt, "Enrollment code collision, drawing another");
                }
                Err(e) => {
                    if let Err(cleanup) = self.mdm.delete_enrollment(&enrollment.enrollment_ref).await {
                        error!(enrollment_ref = %enrollment.enrollment_ref, error = %cleanup, "Failed to remove enrollment after ledger insert failed");
                        metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Resolve a code to the enrollment it stands for and the family it enrolls into.
    pub async fn validate_enrollment_code(&self, code: &str) -> Result<(EnrollmentCodeDBResponse, FamilyDBResponse)> {
        let code = code.trim();
        if !is_enrollment_code(code) {
            return Err(SyncError::Validation("enrollment code must be six digits".to_string()));
        }
        let found = self
            .ledger
            .get_enrollment_code(code)
            .await?
            .ok_or_else(|| SyncError::Validation("enrollment code not found".to_string()))?;
        if found.is_expired_at(Utc::now()) {
            return Err(SyncError::Validation("enrollment code has expired".to_string()));
        }
        let family = self.load_family(found.family_id).await?;
        Ok((found, family))
    }

    // ----- verification and repair -----

    /// Compare the family's profiles against the links the MDM reports. Read-only.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn verify(&self, family_id: FamilyId) -> Result<SyncReport> {
        let family = self.load_family(family_id).await?;
        let group = group_ref(&family)?;
        let profiles = self.ledger.list_family_profiles(family_id).await?;
        let links = self.mdm.list_group_links(group).await.map_err(SyncError::external)?;
        let linked: HashSet<&str> = links.iter().map(|l| l.profile_ref.as_str()).collect();

        let discrepancies: Vec<Discrepancy> = profiles
            .iter()
            .filter(|p| !linked.contains(p.external_profile_ref()))
            .map(|p| {
                warn!(
                    family_profile_id = %abbrev_uuid(&p.id),
                    profile_ref = p.external_profile_ref(),
                    group_ref = group,
                    "Profile link missing in MDM"
                );
                Discrepancy {
                    family_profile_id: p.id,
                    external_profile_ref: p.external_profile_ref().to_string(),
                    kind: DiscrepancyKind::MissingExternally,
                }
            })
            .collect();

        Ok(SyncReport {
            family_id,
            in_sync: discrepancies.is_empty(),
            checked: profiles.len(),
            discrepancies,
        })
    }

    /// Re-link every profile a fresh verification reports missing. Each repair is independent.
    ///
    /// A family without a device group gets one first, after which all its profiles are linked.
    #[instrument(skip(self), fields(family_id = %abbrev_uuid(&family_id)), err)]
    pub async fn repair(&self, family_id: FamilyId) -> Result<RepairReport> {
        let _guard = self.lock_family(family_id).await;
        let family = self.load_family(family_id).await?;
        if family.external_group_ref.is_none() {
            self.provision_group(&family).await?;
        }
        let report = self.verify(family_id).await?;
        let family = self.load_family(family_id).await?;
        let group = group_ref(&family)?;

        let mut results = Vec::with_capacity(report.discrepancies.len());
        for discrepancy in &report.discrepancies {
            let result = match self.mdm.link_profile_to_group(&discrepancy.external_profile_ref, group).await {
                Ok(_) => {
                    metrics::counter!("nookctl_sync_repairs_total", "outcome" => "repaired").increment(1);
                    RepairResult {
                        family_profile_id: discrepancy.family_profile_id,
                        repaired: true,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(profile_ref = %discrepancy.external_profile_ref, error = %e, "Repair link failed");
                    metrics::counter!("nookctl_sync_repairs_total", "outcome" => "failed").increment(1);
                    RepairResult {
                        family_profile_id: discrepancy.family_profile_id,
                        repaired: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }

        let in_sync_after = results.iter().all(|r| r.repaired);
        info!(attempted = results.len(), in_sync_after, "Repair finished");
        Ok(RepairReport {
            family_id,
            results,
            in_sync_after,
        })
    }

    /// Re-assert every expected group link for every family.
    #[instrument(skip(self), err)]
    pub async fn bulk_sync(&self) -> Result<BulkReport> {
        let families = self.ledger.list_families(None).await?;
        let families_checked = families.len();

        let per_family: Vec<(usize, Vec<BulkFailure>)> = futures::stream::iter(families)
            .map(|family| self.sync_family(family))
            .buffer_unordered(self.bulk_concurrency)
            .collect()
            .await;

        let mut report = BulkReport {
            families_checked,
            ..Default::default()
        };
        for (asserted, failures) in per_family {
            report.links_asserted += asserted;
            report.failures.extend(failures);
        }
        info!(
            families = report.families_checked,
            links = report.links_asserted,
            failures = report.failures.len(),
            "Bulk sync finished"
        );
        Ok(report)
    }

    async fn sync_family(&self, family: FamilyDBResponse) -> (usize, Vec<BulkFailure>) {
        let _guard = self.lock_family(family.id).await;
        let Some(group) = family.external_group_ref.as_deref() else {
            return (
                0,
                vec![BulkFailure {
                    family_id: family.id,
                    family_profile_id: None,
                    error: SyncError::MissingGroupReference(family.id).to_string(),
                }],
            );
        };
        let profiles = match self.ledger.list_family_profiles(family.id).await {
            Ok(profiles) => profiles,
            Err(e) => {
                return (
                    0,
                    vec![BulkFailure {
                        family_id: family.id,
                        family_profile_id: None,
                        error: e.to_string(),
                    }],
                );
            }
        };

        let mut asserted = 0;
        let mut failures = Vec::new();
        for profile in profiles {
            match self.mdm.link_profile_to_group(profile.external_profile_ref(), group).await {
                Ok(_) => asserted += 1,
                Err(e) => {
                    warn!(family_id = %abbrev_uuid(&family.id), profile_ref = profile.external_profile_ref(), error = %e, "Bulk sync link failed");
                    failures.push(BulkFailure {
                        family_id: family.id,
                        family_profile_id: Some(profile.id),
                        error: e.to_string(),
                    });
                }
            }
        }
        (asserted, failures)
    }

    // ----- master profiles -----

    /// Create the master profile for every predefined type that does not have one yet.
    /// Safe to run repeatedly and from several instances at once.
    #[instrument(skip(self), err)]
    pub async fn bootstrap_master_profiles(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();
        for profile_type in ProfileType::PREDEFINED {
            match self.bootstrap_master_profile(profile_type).await {
                Ok(true) => report.created.push(profile_type),
                Ok(false) => report.existing.push(profile_type),
                Err(e) => {
                    error!(%profile_type, error = %e, "Failed to bootstrap master profile");
                    report.failed.push(BootstrapFailure {
                        profile_type,
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            created = report.created.len(),
            existing = report.existing.len(),
            failed = report.failed.len(),
            "Master profile bootstrap finished"
        );
        Ok(report)
    }

    /// Returns whether a master profile was created.
    async fn bootstrap_master_profile(&self, profile_type: ProfileType) -> Result<bool> {
        if self.ledger.get_master_profile_by_type(profile_type).await?.is_some() {
            return Ok(false);
        }

        let blob = self.content.render(profile_type, GLOBAL_FAMILY_NAME, None)?;
        let profile_ref = self
            .mdm
            .create_profile(profile_type.display_name(), &blob)
            .await
            .map_err(|source| SyncError::ProfileCreationFailed { source })?;

        let request = MasterProfileCreateDBRequest {
            profile_type,
            name: profile_type.display_name().to_string(),
            description: Some(profile_type.default_description().to_string()),
            external_profile_ref: profile_ref.clone(),
        };
        match self.ledger.create_master_profile(request).await {
            Ok(master) => {
                info!(%profile_type, profile_ref = %master.external_profile_ref, "Created master profile");
                Ok(true)
            }
            Err(LedgerError::MasterProfileExists(_)) => {
                debug!(%profile_type, "Master profile created concurrently, discarding ours");
                self.discard_profile(&profile_ref).await;
                Ok(false)
            }
            Err(e) => {
                self.discard_profile(&profile_ref).await;
                Err(e.into())
            }
        }
    }

    /// Master profiles in predefined type order.
    pub async fn list_master_profiles(&self) -> Result<Vec<MasterProfileDBResponse>> {
        let mut masters = self.ledger.list_master_profiles().await?;
        masters.sort_by_key(|m| ProfileType::PREDEFINED.iter().position(|t| *t == m.profile_type));
        Ok(masters)
    }

    /// Delete a master profile no family uses any more.
    ///
    /// The ledger row goes first: its reference check is atomic with the delete, so a family
    /// profile created in the meantime keeps the external profile alive.
    #[instrument(skip(self), fields(master_profile_id = %abbrev_uuid(&id)), err)]
    pub async fn delete_master_profile(&self, id: MasterProfileId) -> Result<DeleteOutcome> {
        let master = self.get_master_profile(id).await?;
        if !self.ledger.delete_master_profile(id).await? {
            return Err(SyncError::NotFound {
                entity: "master profile",
                id,
            });
        }

        let mut outcome = DeleteOutcome::default();
        if let Err(e) = self.mdm.delete_profile(&master.external_profile_ref).await {
            warn!(profile_ref = %master.external_profile_ref, error = %e, "Failed to delete master profile in MDM");
            outcome.cleanup_failed(format!("deleting profile {}", master.external_profile_ref), &e);
        }
        info!(profile_type = %master.profile_type, "Deleted master profile");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::MobileconfigGenerator;
    use crate::db::models::family_profiles::ProfileSource;
    use crate::ledger::memory::InMemoryLedger;
    use crate::mdm::fake::FakeMdm;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        mdm: Arc<FakeMdm>,
        coordinator: SyncCoordinator,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        let mdm = Arc::new(FakeMdm::new());
        let content = Arc::new(MobileconfigGenerator::new().unwrap());
        let coordinator = SyncCoordinator::new(ledger.clone(), mdm.clone(), content);
        Harness { ledger, mdm, coordinator }
    }

    async fn bootstrapped() -> Harness {
        let h = harness();
        let report = h.coordinator.bootstrap_master_profiles().await.unwrap();
        assert_eq!(report.created.len(), 4);
        h
    }

    fn predefined(profile_type: ProfileType) -> AssignProfile {
        AssignProfile {
            profile_type,
            name: None,
            description: None,
            config: None,
        }
    }

    fn custom_config() -> CustomProfileConfig {
        let mut restrictions = BTreeMap::new();
        restrictions.insert("allow_camera".to_string(), serde_json::Value::Bool(false));
        CustomProfileConfig {
            allowed_apps: vec!["com.apple.mobilephone".to_string()],
            restrictions,
        }
    }

    fn custom() -> AssignProfile {
        AssignProfile {
            profile_type: ProfileType::Custom,
            name: Some("School days".to_string()),
            description: None,
            config: Some(custom_config()),
        }
    }

    async fn master_ref(h: &Harness, profile_type: ProfileType) -> String {
        h.ledger
            .get_master_profile_by_type(profile_type)
            .await
            .unwrap()
            .unwrap()
            .external_profile_ref
    }

    #[tokio::test]
    async fn test_second_family_reuses_master_profile() {
        let h = bootstrapped().await;
        let parent = Uuid::new_v4();
        let f1 = h.coordinator.create_family(parent, "Smiths").await.unwrap();
        h.coordinator.assign_profile(f1.id, predefined(ProfileType::FirstPhone)).await.unwrap();

        let profiles_before = h.mdm.calls("create_profile");
        let links_before = h.mdm.calls("link_profile_to_group");

        let f2 = h.coordinator.create_family(parent, "Joneses").await.unwrap();
        let profile = h.coordinator.assign_profile(f2.id, predefined(ProfileType::FirstPhone)).await.unwrap();

        let mp = master_ref(&h, ProfileType::FirstPhone).await;
        assert_eq!(h.mdm.calls("create_profile"), profiles_before);
        assert_eq!(h.mdm.calls("link_profile_to_group"), links_before + 1);
        assert!(h.mdm.is_linked(&mp, f2.external_group_ref.as_deref().unwrap()));
        assert!(h.mdm.is_linked(&mp, f1.external_group_ref.as_deref().unwrap()));

        assert!(profile.is_shared());
        assert!(profile.master_profile_id().is_some());
        assert_eq!(profile.external_profile_ref(), mp);
    }

    #[tokio::test]
    async fn test_custom_profile_creates_and_links_individual_profile() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let before = h.mdm.profile_count();

        let profile = h.coordinator.assign_profile(family.id, custom()).await.unwrap();

        assert_eq!(h.mdm.profile_count(), before + 1);
        assert!(matches!(profile.source, ProfileSource::Individual { .. }));
        assert!(profile.master_profile_id().is_none());
        assert!(h.mdm.is_linked(profile.external_profile_ref(), family.external_group_ref.as_deref().unwrap()));
        let stored = h.mdm.profile(profile.external_profile_ref()).unwrap();
        assert_eq!(stored.name, "School days");
        assert!(stored.content.contains("com.apple.mobilephone"));
    }

    #[tokio::test]
    async fn test_assign_then_verify_is_in_sync() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();
        h.coordinator.assign_profile(family.id, custom()).await.unwrap();

        let report = h.coordinator.verify(family.id).await.unwrap();
        assert!(report.in_sync);
        assert_eq!(report.checked, 2);
        assert!(report.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_repair_restores_link_removed_out_of_band() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let group = family.external_group_ref.clone().unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::Guardian)).await.unwrap();

        h.mdm.remove_link_out_of_band(profile.external_profile_ref(), &group);

        let report = h.coordinator.verify(family.id).await.unwrap();
        assert!(!report.in_sync);
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].family_profile_id, profile.id);
        assert_eq!(report.discrepancies[0].kind, DiscrepancyKind::MissingExternally);

        let profiles_before = h.mdm.profile_count();
        let repair = h.coordinator.repair(family.id).await.unwrap();
        assert!(repair.in_sync_after);
        assert_eq!(repair.results.len(), 1);
        assert!(repair.results[0].repaired);

        assert!(h.coordinator.verify(family.id).await.unwrap().in_sync);
        assert_eq!(h.coordinator.list_family_profiles(family.id).await.unwrap().len(), 1);
        assert_eq!(h.coordinator.list_master_profiles().await.unwrap().len(), 4);
        assert_eq!(h.mdm.profile_count(), profiles_before);
    }

    #[tokio::test]
    async fn test_repair_continues_after_individual_failure() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let group = family.external_group_ref.clone().unwrap();
        let a = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();
        let b = h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        h.mdm.remove_link_out_of_band(a.external_profile_ref(), &group);
        h.mdm.remove_link_out_of_band(b.external_profile_ref(), &group);

        h.mdm.fail_next("link_profile_to_group", ExternalServiceError::from_status(503, "busy", None));
        let repair = h.coordinator.repair(family.id).await.unwrap();

        assert_eq!(repair.results.len(), 2);
        assert_eq!(repair.results.iter().filter(|r| r.repaired).count(), 1);
        assert!(!repair.in_sync_after);
        assert_eq!(h.coordinator.verify(family.id).await.unwrap().discrepancies.len(), 1);
    }

    #[tokio::test]
    async fn test_reassign_to_other_family_profile_is_rejected() {
        let h = bootstrapped().await;
        let parent = Uuid::new_v4();
        let f1 = h.coordinator.create_family(parent, "Smiths").await.unwrap();
        let f2 = h.coordinator.create_family(parent, "Joneses").await.unwrap();
        let foreign = h.coordinator.assign_profile(f2.id, predefined(ProfileType::TimeOut)).await.unwrap();
        let device = h.coordinator.register_device(f1.id, "Tablet").await.unwrap();

        let err = h.coordinator.reassign_device(device.id, Some(foreign.id)).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)), "got {err:?}");
        assert_eq!(h.coordinator.get_device(device.id).await.unwrap().assigned_family_profile_id, None);
    }

    #[tokio::test]
    async fn test_delete_family_cleans_up_externally() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let group = family.external_group_ref.clone().unwrap();
        let shared = h.coordinator.assign_profile(family.id, predefined(ProfileType::FirstPhone)).await.unwrap();
        let individual = h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.reassign_device(device.id, Some(shared.id)).await.unwrap();

        let outcome = h.coordinator.delete_family(family.id).await.unwrap();

        assert!(!outcome.external_cleanup_pending);
        assert!(h.mdm.profile(individual.external_profile_ref()).is_none());
        assert!(h.mdm.profile(shared.external_profile_ref()).is_some());
        assert!(!h.mdm.is_linked(shared.external_profile_ref(), &group));
        assert!(!h.mdm.has_group(&group));
        assert_eq!(h.coordinator.list_master_profiles().await.unwrap().len(), 4);

        assert!(matches!(h.coordinator.get_family(family.id).await, Err(SyncError::NotFound { .. })));
        assert!(h.ledger.get_family_profile(shared.id).await.unwrap().is_none());
        assert!(h.ledger.get_family_profile(individual.id).await.unwrap().is_none());
        assert!(h.ledger.get_device(device.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_family_completes_locally_when_mdm_is_down() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        h.mdm.fail_next("delete_profile", ExternalServiceError::transport("timed out"));
        h.mdm.fail_next("delete_group", ExternalServiceError::transport("timed out"));

        let outcome = h.coordinator.delete_family(family.id).await.unwrap();

        assert!(outcome.external_cleanup_pending);
        assert_eq!(outcome.warnings.len(), 2);
        assert!(h.ledger.get_family(family.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_predefined_before_bootstrap_is_rejected() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();

        let err = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap_err();
        assert!(matches!(err, SyncError::NotBootstrapped(ProfileType::Explorer)));
        assert_eq!(h.mdm.calls("link_profile_to_group"), 0);
    }

    #[tokio::test]
    async fn test_failed_custom_link_deletes_orphan() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let before = h.mdm.profile_count();
        h.mdm.fail_next("link_profile_to_group", ExternalServiceError::transport("timed out"));

        let err = h.coordinator.assign_profile(family.id, custom()).await.unwrap_err();

        match &err {
            SyncError::External { source, orphan_cleanup } => {
                assert!(source.retryable);
                assert!(orphan_cleanup.is_none());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(h.mdm.calls("delete_profile"), 1);
        assert_eq!(h.mdm.profile_count(), before);
        assert!(h.coordinator.list_family_profiles(family.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_orphan_cleanup_is_reported_as_warning() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        h.mdm.fail_next("link_profile_to_group", ExternalServiceError::from_status(422, "bad group", None));
        h.mdm.fail_next("delete_profile", ExternalServiceError::transport("timed out"));

        let err = h.coordinator.assign_profile(family.id, custom()).await.unwrap_err();

        assert_eq!(err.warnings().len(), 1);
        assert!(!err.external_source().unwrap().retryable);
        assert!(h.coordinator.list_family_profiles(family.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_master_link_persists_nothing_and_keeps_master() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        h.mdm.fail_next("link_profile_to_group", ExternalServiceError::from_status(503, "busy", None));

        let err = h.coordinator.assign_profile(family.id, predefined(ProfileType::Guardian)).await.unwrap_err();

        assert!(err.external_source().unwrap().retryable);
        assert_eq!(h.mdm.calls("delete_profile"), 0);
        assert!(h.mdm.profile(&master_ref(&h, ProfileType::Guardian).await).is_some());
        assert!(h.coordinator.list_family_profiles(family.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_profile_creation_aborts() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let links_before = h.mdm.calls("link_profile_to_group");
        h.mdm.fail_next("create_profile", ExternalServiceError::from_status(500, "boom", None));

        let err = h.coordinator.assign_profile(family.id, custom()).await.unwrap_err();

        assert!(matches!(err, SyncError::ProfileCreationFailed { .. }));
        assert_eq!(h.mdm.calls("link_profile_to_group"), links_before);
        assert!(h.coordinator.list_family_profiles(family.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_failure_after_custom_link_removes_profile() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let before = h.mdm.profile_count();
        h.ledger.fail_next_writes(1);

        let err = h.coordinator.assign_profile(family.id, custom()).await.unwrap_err();

        assert!(matches!(err, SyncError::Ledger(_)));
        assert_eq!(h.mdm.profile_count(), before);
    }

    #[tokio::test]
    async fn test_missing_group_reference_checked_before_profile_creation() {
        let h = bootstrapped().await;
        let family = h
            .ledger
            .create_family(FamilyCreateDBRequest {
                name: "Legacy".to_string(),
                parent_id: Uuid::new_v4(),
                external_group_ref: None,
            })
            .await
            .unwrap();
        let before = h.mdm.calls("create_profile");

        let err = h.coordinator.assign_profile(family.id, custom()).await.unwrap_err();

        assert!(matches!(err, SyncError::MissingGroupReference(id) if id == family.id));
        assert_eq!(h.mdm.calls("create_profile"), before);
    }

    #[tokio::test]
    async fn test_duplicate_predefined_type_is_conflict() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();

        let err = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));

        // Custom profiles are not limited
        h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        assert_eq!(h.coordinator.list_family_profiles(family.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_config_validation() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();

        let mut with_config = predefined(ProfileType::Explorer);
        with_config.config = Some(custom_config());
        assert!(matches!(
            h.coordinator.assign_profile(family.id, with_config).await,
            Err(SyncError::Validation(_))
        ));

        let mut without_config = custom();
        without_config.config = None;
        assert!(matches!(
            h.coordinator.assign_profile(family.id, without_config).await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unassign_clears_devices_and_reports_pending_cleanup() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.reassign_device(device.id, Some(profile.id)).await.unwrap();
        h.mdm.fail_next("delete_profile", ExternalServiceError::from_status(502, "bad gateway", None));

        let outcome = h.coordinator.unassign_profile(profile.id).await.unwrap();

        assert!(outcome.external_cleanup_pending);
        assert!(h.ledger.get_family_profile(profile.id).await.unwrap().is_none());
        assert_eq!(h.coordinator.get_device(device.id).await.unwrap().assigned_family_profile_id, None);
    }

    #[tokio::test]
    async fn test_unassign_shared_profile_only_unlinks() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::TimeOut)).await.unwrap();

        let outcome = h.coordinator.unassign_profile(profile.id).await.unwrap();

        assert_eq!(outcome, DeleteOutcome::default());
        assert!(h.mdm.profile(profile.external_profile_ref()).is_some());
        assert!(!h.mdm.is_linked(profile.external_profile_ref(), family.external_group_ref.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_reassign_unchanged_is_noop() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.record_enrollment(device.id, "dev-1").await.unwrap();
        h.coordinator.reassign_device(device.id, Some(profile.id)).await.unwrap();
        let links = h.mdm.calls("link_profile_to_device");

        h.coordinator.reassign_device(device.id, Some(profile.id)).await.unwrap();

        assert_eq!(h.mdm.calls("link_profile_to_device"), links);
        assert_eq!(h.mdm.calls("unlink_profile_from_device"), 0);
    }

    #[tokio::test]
    async fn test_reassign_enrolled_device_moves_link() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let explorer = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();
        let time_out = h.coordinator.assign_profile(family.id, predefined(ProfileType::TimeOut)).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.record_enrollment(device.id, "dev-1").await.unwrap();

        h.coordinator.reassign_device(device.id, Some(explorer.id)).await.unwrap();
        assert!(h.mdm.is_linked_to_device(explorer.external_profile_ref(), "dev-1"));

        let moved = h.coordinator.reassign_device(device.id, Some(time_out.id)).await.unwrap();
        assert_eq!(moved.assigned_family_profile_id, Some(time_out.id));
        assert!(h.mdm.is_linked_to_device(time_out.external_profile_ref(), "dev-1"));
        assert!(!h.mdm.is_linked_to_device(explorer.external_profile_ref(), "dev-1"));

        let cleared = h.coordinator.reassign_device(device.id, None).await.unwrap();
        assert_eq!(cleared.assigned_family_profile_id, None);
        assert!(!h.mdm.is_linked_to_device(time_out.external_profile_ref(), "dev-1"));
    }

    #[tokio::test]
    async fn test_reassign_link_failure_leaves_assignment() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.record_enrollment(device.id, "dev-1").await.unwrap();
        h.mdm.fail_next("link_profile_to_device", ExternalServiceError::transport("timed out"));

        let err = h.coordinator.reassign_device(device.id, Some(profile.id)).await.unwrap_err();

        assert!(err.external_source().unwrap().retryable);
        assert_eq!(h.coordinator.get_device(device.id).await.unwrap().assigned_family_profile_id, None);
    }

    #[tokio::test]
    async fn test_enrollment_links_assigned_profile() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::FirstPhone)).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.reassign_device(device.id, Some(profile.id)).await.unwrap();
        assert_eq!(h.mdm.calls("link_profile_to_device"), 0);

        let enrolled = h.coordinator.record_enrollment(device.id, "dev-42").await.unwrap();

        assert_eq!(enrolled.external_device_ref.as_deref(), Some("dev-42"));
        assert!(h.mdm.is_linked_to_device(profile.external_profile_ref(), "dev-42"));
    }

    #[tokio::test]
    async fn test_delete_device_with_unenroll() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.record_enrollment(device.id, "dev-7").await.unwrap();

        let outcome = h.coordinator.delete_device(device.id, true).await.unwrap();

        assert!(!outcome.external_cleanup_pending);
        assert_eq!(h.mdm.deleted_devices(), vec!["dev-7".to_string()]);
        assert!(h.ledger.get_device(device.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_family_failure_persists_nothing() {
        let h = harness();
        let parent = Uuid::new_v4();
        h.mdm.fail_next("create_group", ExternalServiceError::transport("timed out"));

        let err = h.coordinator.create_family(parent, "Smiths").await.unwrap_err();
        assert!(err.external_source().unwrap().retryable);
        assert!(h.coordinator.list_families(Some(parent)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_family_ledger_failure_removes_group() {
        let h = harness();
        h.ledger.fail_next_writes(1);

        let err = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap_err();

        assert!(matches!(err, SyncError::Ledger(_)));
        assert_eq!(h.mdm.calls("delete_group"), 1);
        assert!(!h.mdm.has_group("grp-1"));
    }

    #[tokio::test]
    async fn test_rename_family_renames_group_first() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let group = family.external_group_ref.clone().unwrap();

        h.mdm.fail_next("rename_group", ExternalServiceError::from_status(503, "busy", None));
        assert!(h.coordinator.rename_family(family.id, "Smith-Joneses").await.is_err());
        assert_eq!(h.coordinator.get_family(family.id).await.unwrap().name, "Smiths");

        let renamed = h.coordinator.rename_family(family.id, "Smith-Joneses").await.unwrap();
        assert_eq!(renamed.name, "Smith-Joneses");
        assert_eq!(h.mdm.group_name(&group).as_deref(), Some("Smith-Joneses"));
    }

    #[tokio::test]
    async fn test_update_custom_profile_pushes_content() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, custom()).await.unwrap();

        let mut config = custom_config();
        config.allowed_apps.push("com.apple.MobileSMS".to_string());
        let updated = h
            .coordinator
            .update_profile(
                profile.id,
                ProfileChanges {
                    name: Some("Weekends".to_string()),
                    config: Some(config),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "Weekends");
        let stored = h.mdm.profile(profile.external_profile_ref()).unwrap();
        assert_eq!(stored.name, "Weekends");
        assert!(stored.content.contains("com.apple.MobileSMS"));
    }

    #[tokio::test]
    async fn test_update_predefined_profile_is_local_only() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::Guardian)).await.unwrap();

        let renamed = h
            .coordinator
            .update_profile(
                profile.id,
                ProfileChanges {
                    name: Some("Teen phone".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "Teen phone");
        assert_eq!(h.mdm.calls("update_profile"), 0);

        let err = h
            .coordinator
            .update_profile(
                profile.id,
                ProfileChanges {
                    config: Some(custom_config()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let h = bootstrapped().await;
        let profiles = h.mdm.profile_count();

        let again = h.coordinator.bootstrap_master_profiles().await.unwrap();

        assert!(again.created.is_empty());
        assert_eq!(again.existing, ProfileType::PREDEFINED.to_vec());
        assert_eq!(h.mdm.profile_count(), profiles);
        let types: Vec<ProfileType> = h.coordinator.list_master_profiles().await.unwrap().iter().map(|m| m.profile_type).collect();
        assert_eq!(types, ProfileType::PREDEFINED.to_vec());
    }

    #[tokio::test]
    async fn test_bootstrap_failure_does_not_abort_other_types() {
        let h = harness();
        h.mdm.fail_next("create_profile", ExternalServiceError::from_status(503, "busy", None));

        let report = h.coordinator.bootstrap_master_profiles().await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].profile_type, ProfileType::FirstPhone);
        assert_eq!(report.created.len(), 3);

        let retry = h.coordinator.bootstrap_master_profiles().await.unwrap();
        assert_eq!(retry.created, vec![ProfileType::FirstPhone]);
    }

    #[tokio::test]
    async fn test_bulk_sync_reasserts_missing_links() {
        let h = bootstrapped().await;
        let parent = Uuid::new_v4();
        let f1 = h.coordinator.create_family(parent, "Smiths").await.unwrap();
        let f2 = h.coordinator.create_family(parent, "Joneses").await.unwrap();
        let p1 = h.coordinator.assign_profile(f1.id, predefined(ProfileType::FirstPhone)).await.unwrap();
        h.coordinator.assign_profile(f2.id, predefined(ProfileType::FirstPhone)).await.unwrap();
        h.coordinator.assign_profile(f2.id, custom()).await.unwrap();
        h.mdm.remove_link_out_of_band(p1.external_profile_ref(), f1.external_group_ref.as_deref().unwrap());

        let report = h.coordinator.with_bulk_concurrency(2).bulk_sync().await.unwrap();

        assert_eq!(report.families_checked, 2);
        assert_eq!(report.links_asserted, 3);
        assert!(report.failures.is_empty());
        assert!(h.mdm.is_linked(p1.external_profile_ref(), f1.external_group_ref.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_delete_master_profile_is_guarded() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();
        let master_id = profile.master_profile_id().unwrap();

        let err = h.coordinator.delete_master_profile(master_id).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict(_)));

        h.coordinator.unassign_profile(profile.id).await.unwrap();
        let outcome = h.coordinator.delete_master_profile(master_id).await.unwrap();
        assert!(!outcome.external_cleanup_pending);
        assert_eq!(h.coordinator.list_master_profiles().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_assignments_to_one_family() {
        let h = bootstrapped().await;
        let family_id = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap().id;
        let coordinator = Arc::new(h.coordinator);

        let tasks: Vec<_> = ProfileType::PREDEFINED
            .into_iter()
            .map(|profile_type| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.assign_profile(family_id, predefined(profile_type)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let report = coordinator.verify(family_id).await.unwrap();
        assert!(report.in_sync);
        assert_eq!(report.checked, 4);
    }

    #[tokio::test]
    async fn test_delete_master_profile_ledger_failure_keeps_external_profile() {
        let h = bootstrapped().await;
        let master = h.ledger.get_master_profile_by_type(ProfileType::Explorer).await.unwrap().unwrap();
        h.ledger.fail_next_writes(1);

        let err = h.coordinator.delete_master_profile(master.id).await.unwrap_err();

        assert!(matches!(err, SyncError::Ledger(_)));
        assert_eq!(h.mdm.calls("delete_profile"), 0);
        assert!(h.mdm.profile(&master.external_profile_ref).is_some());
        assert!(h.ledger.get_master_profile(master.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_master_profile_in_use_leaves_mdm_untouched() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::Guardian)).await.unwrap();

        let err = h.coordinator.delete_master_profile(profile.master_profile_id().unwrap()).await.unwrap_err();

        assert!(matches!(err, SyncError::Conflict(_)));
        assert_eq!(h.mdm.calls("delete_profile"), 0);
        assert!(h.mdm.is_linked(profile.external_profile_ref(), family.external_group_ref.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_delete_master_profile_mdm_failure_is_pending_cleanup() {
        let h = bootstrapped().await;
        let master = h.ledger.get_master_profile_by_type(ProfileType::TimeOut).await.unwrap().unwrap();
        h.mdm.fail_next("delete_profile", ExternalServiceError::transport("timed out"));

        let outcome = h.coordinator.delete_master_profile(master.id).await.unwrap();

        assert!(outcome.external_cleanup_pending);
        assert_eq!(outcome.warnings.len(), 1);
        assert!(h.ledger.get_master_profile(master.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reassign_unlink_failure_still_moves_assignment() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let explorer = h.coordinator.assign_profile(family.id, predefined(ProfileType::Explorer)).await.unwrap();
        let time_out = h.coordinator.assign_profile(family.id, predefined(ProfileType::TimeOut)).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.record_enrollment(device.id, "dev-1").await.unwrap();
        h.coordinator.reassign_device(device.id, Some(explorer.id)).await.unwrap();

        h.mdm.fail_next("unlink_profile_from_device", ExternalServiceError::transport("timed out"));
        let moved = h.coordinator.reassign_device(device.id, Some(time_out.id)).await.unwrap();

        assert_eq!(moved.assigned_family_profile_id, Some(time_out.id));
        assert!(h.mdm.is_linked_to_device(time_out.external_profile_ref(), "dev-1"));
        // The stale link stays until the next successful unlink
        assert!(h.mdm.is_linked_to_device(explorer.external_profile_ref(), "dev-1"));
    }

    #[tokio::test]
    async fn test_clearing_assignment_succeeds_while_unlink_fails() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, predefined(ProfileType::Guardian)).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.record_enrollment(device.id, "dev-3").await.unwrap();
        h.coordinator.reassign_device(device.id, Some(profile.id)).await.unwrap();

        h.mdm.fail_next("unlink_profile_from_device", ExternalServiceError::from_status(503, "busy", None));
        let cleared = h.coordinator.reassign_device(device.id, None).await.unwrap();

        assert_eq!(cleared.assigned_family_profile_id, None);
        assert_eq!(h.mdm.calls("unlink_profile_from_device"), 1);
    }

    #[tokio::test]
    async fn test_enrollment_ledger_failure_removes_new_link() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let profile = h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.reassign_device(device.id, Some(profile.id)).await.unwrap();
        h.ledger.fail_next_writes(1);

        let err = h.coordinator.record_enrollment(device.id, "dev-9").await.unwrap_err();

        assert!(matches!(err, SyncError::Ledger(_)));
        assert!(!h.mdm.is_linked_to_device(profile.external_profile_ref(), "dev-9"));
        assert!(h.coordinator.get_device(device.id).await.unwrap().external_device_ref.is_none());
    }

    #[tokio::test]
    async fn test_enrollment_with_taken_reference_is_rolled_back() {
        let h = bootstrapped().await;
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let tablet = h.coordinator.register_device(family.id, "Tablet").await.unwrap();
        h.coordinator.record_enrollment(tablet.id, "dev-5").await.unwrap();

        let profile = h.coordinator.assign_profile(family.id, custom()).await.unwrap();
        let phone = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.reassign_device(phone.id, Some(profile.id)).await.unwrap();

        let err = h.coordinator.record_enrollment(phone.id, "dev-5").await.unwrap_err();

        assert!(matches!(err, SyncError::Ledger(LedgerError::Db(ref e)) if e.is_unique_violation_on("devices_external_device_ref_unique")));
        assert!(!h.mdm.is_linked_to_device(profile.external_profile_ref(), "dev-5"));
        assert!(h.coordinator.get_device(phone.id).await.unwrap().external_device_ref.is_none());
    }

    #[tokio::test]
    async fn test_repair_provisions_missing_group() {
        let h = bootstrapped().await;
        let family = h
            .ledger
            .create_family(FamilyCreateDBRequest {
                name: "Legacy".to_string(),
                parent_id: Uuid::new_v4(),
                external_group_ref: None,
            })
            .await
            .unwrap();
        let master = h.ledger.get_master_profile_by_type(ProfileType::Explorer).await.unwrap().unwrap();
        h.ledger
            .create_family_profile(FamilyProfileCreateDBRequest {
                family_id: family.id,
                profile_type: ProfileType::Explorer,
                name: "Explorer".to_string(),
                description: None,
                config: serde_json::json!({}),
                source: NewProfileSource::Master(master.id),
            })
            .await
            .unwrap();
        assert!(matches!(h.coordinator.verify(family.id).await, Err(SyncError::MissingGroupReference(_))));

        let repair = h.coordinator.repair(family.id).await.unwrap();

        assert!(repair.in_sync_after);
        assert_eq!(repair.results.len(), 1);
        let group = h.coordinator.get_family(family.id).await.unwrap().external_group_ref.unwrap();
        assert_eq!(h.mdm.group_name(&group).as_deref(), Some("Legacy"));
        assert!(h.mdm.is_linked(&master.external_profile_ref, &group));
        assert!(h.coordinator.verify(family.id).await.unwrap().in_sync);
    }

    #[tokio::test]
    async fn test_repair_group_provisioning_ledger_failure_removes_group() {
        let h = harness();
        let family = h
            .ledger
            .create_family(FamilyCreateDBRequest {
                name: "Legacy".to_string(),
                parent_id: Uuid::new_v4(),
                external_group_ref: None,
            })
            .await
            .unwrap();
        h.ledger.fail_next_writes(1);

        let err = h.coordinator.repair(family.id).await.unwrap_err();

        assert!(matches!(err, SyncError::Ledger(_)));
        assert_eq!(h.mdm.calls("create_group"), 1);
        assert!(!h.mdm.has_group("grp-1"));
        assert!(h.coordinator.get_family(family.id).await.unwrap().external_group_ref.is_none());
    }

    #[tokio::test]
    async fn test_issue_enrollment_code() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let before = Utc::now();

        let code = h.coordinator.issue_enrollment_code(family.id).await.unwrap();

        assert_eq!(code.family_id, family.id);
        assert!(is_enrollment_code(&code.code), "got {}", code.code);
        assert_eq!(h.mdm.enrollment_group(&code.external_enrollment_ref), family.external_group_ref);
        assert!(code.expires_at >= before + Duration::hours(23));
        assert!(code.expires_at <= Utc::now() + Duration::hours(24));

        let (found, owner) = h.coordinator.validate_enrollment_code(&code.code).await.unwrap();
        assert_eq!(found, code);
        assert_eq!(owner.name, "Smiths");
    }

    #[tokio::test]
    async fn test_enrollment_code_requires_group() {
        let h = harness();
        let family = h
            .ledger
            .create_family(FamilyCreateDBRequest {
                name: "Legacy".to_string(),
                parent_id: Uuid::new_v4(),
                external_group_ref: None,
            })
            .await
            .unwrap();

        let err = h.coordinator.issue_enrollment_code(family.id).await.unwrap_err();

        assert!(matches!(err, SyncError::MissingGroupReference(_)));
        assert_eq!(h.mdm.calls("create_enrollment"), 0);
    }

    #[tokio::test]
    async fn test_enrollment_code_ledger_failure_removes_enrollment() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        h.ledger.fail_next_writes(1);

        let err = h.coordinator.issue_enrollment_code(family.id).await.unwrap_err();

        assert!(matches!(err, SyncError::Ledger(_)));
        assert_eq!(h.mdm.calls("delete_enrollment"), 1);
        assert_eq!(h.mdm.enrollment_count(), 0);
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_malformed_and_expired_codes() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        h.ledger
            .create_enrollment_code(EnrollmentCodeCreateDBRequest {
                family_id: family.id,
                code: "123456".to_string(),
                external_enrollment_ref: "enr-1".to_string(),
                enrollment_url: "https://mdm.test/enroll/?c=enr-1".to_string(),
                expires_at: Utc::now() - Duration::minutes(1),
            })
            .await
            .unwrap();

        for code in ["123456", "654321", "12ab56", "1234567"] {
            let err = h.coordinator.validate_enrollment_code(code).await.unwrap_err();
            assert!(matches!(err, SyncError::Validation(_)), "{code}: {err:?}");
        }
        let expired = h.coordinator.validate_enrollment_code("123456").await.unwrap_err();
        assert!(expired.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn test_delete_family_removes_enrollments() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let code = h.coordinator.issue_enrollment_code(family.id).await.unwrap();

        let outcome = h.coordinator.delete_family(family.id).await.unwrap();

        assert!(!outcome.external_cleanup_pending);
        assert_eq!(h.mdm.enrollment_count(), 0);
        assert!(h.ledger.get_enrollment_code(&code.code).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_device() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();

        let err = h.coordinator.lock_device(device.id, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(h.mdm.calls("lock_device"), 0);

        h.coordinator.record_enrollment(device.id, "dev-2").await.unwrap();
        h.coordinator.lock_device(device.id, None).await.unwrap();
        h.coordinator.lock_device(device.id, Some("  Dinner time ")).await.unwrap();

        assert_eq!(
            h.mdm.locks(),
            vec![
                ("dev-2".to_string(), DEFAULT_LOCK_MESSAGE.to_string()),
                ("dev-2".to_string(), "Dinner time".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_device_mdm_failure_is_external() {
        let h = harness();
        let family = h.coordinator.create_family(Uuid::new_v4(), "Smiths").await.unwrap();
        let device = h.coordinator.register_device(family.id, "Phone").await.unwrap();
        h.coordinator.record_enrollment(device.id, "dev-2").await.unwrap();
        h.mdm.fail_next("lock_device", ExternalServiceError::from_status(503, "busy", None));

        let err = h.coordinator.lock_device(device.id, Some("Bedtime")).await.unwrap_err();

        assert!(err.external_source().unwrap().retryable);
    }
}
