//! Database models for devices.

use crate::types::{DeviceId, FamilyId, FamilyProfileId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to register a new device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCreateDBRequest {
    pub family_id: FamilyId,
    pub name: String,
    pub assigned_family_profile_id: Option<FamilyProfileId>,
    pub external_device_ref: Option<String>,
}

/// Request to update a device's descriptive fields. Assignment changes go through
/// dedicated methods so a profile can be cleared as well as set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceUpdateDBRequest {
    pub name: Option<String>,
}

/// Database representation of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeviceDBResponse {
    pub id: DeviceId,
    pub family_id: FamilyId,
    pub name: String,
    pub assigned_family_profile_id: Option<FamilyProfileId>,
    pub external_device_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
