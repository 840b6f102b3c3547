//! API request/response models for devices.

use crate::db::models::devices::DeviceDBResponse;
use crate::types::{DeviceId, FamilyId, FamilyProfileId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Request body for registering a device with a family.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceCreate {
    #[schema(example = "Sam's iPhone")]
    pub name: String,
}

/// Request body for changing which profile a device receives. `null` clears the assignment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceProfileAssignment {
    #[schema(value_type = Option<String>, format = "uuid")]
    pub family_profile_id: Option<FamilyProfileId>,
}

/// Request body recording that a device enrolled in the MDM.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceEnrollment {
    #[schema(example = "118234")]
    pub external_device_ref: String,
}

/// Request body for locking a device's screen.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DeviceLock {
    /// Shown on the lock screen. Defaults to a generic message.
    #[serde(default)]
    #[schema(example = "Time for dinner")]
    pub message: Option<String>,
}

/// Query parameters for deleting a device
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct DeleteDeviceQuery {
    /// Also remove the device from the MDM instead of only detaching its profile
    #[serde(default)]
    pub unenroll: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeviceResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: DeviceId,
    #[schema(value_type = String, format = "uuid")]
    pub family_id: FamilyId,
    pub name: String,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub assigned_family_profile_id: Option<FamilyProfileId>,
    pub external_device_ref: Option<String>,
    /// Whether the device has enrolled in the MDM
    pub enrolled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<DeviceDBResponse> for DeviceResponse {
    fn from(db: DeviceDBResponse) -> Self {
        Self {
            id: db.id,
            family_id: db.family_id,
            name: db.name,
            assigned_family_profile_id: db.assigned_family_profile_id,
            enrolled: db.external_device_ref.is_some(),
            external_device_ref: db.external_device_ref,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}
