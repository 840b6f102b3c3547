//! Database models for master profiles.

use crate::types::{MasterProfileId, ProfileType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to record a master profile that already exists in the MDM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterProfileCreateDBRequest {
    pub profile_type: ProfileType,
    pub name: String,
    pub description: Option<String>,
    pub external_profile_ref: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterProfileUpdateDBRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Database representation of a master profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterProfileDBResponse {
    pub id: MasterProfileId,
    pub profile_type: ProfileType,
    pub name: String,
    pub description: Option<String>,
    pub external_profile_ref: String,
    pub created_at: DateTime<Utc>,
}
