//! Database models for family profiles.
//!
//! A family profile is backed by exactly one external profile: either the shared master profile
//! for its predefined type, or an individual profile owned by the family. [`ProfileSource`] makes
//! the two cases exhaustive so callers cannot read a reference from the wrong place.

use crate::types::{FamilyId, FamilyProfileId, MasterProfileId, ProfileType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a family profile's content lives in the MDM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileSource {
    /// Shared with every family using the same predefined type.
    Master {
        master_profile_id: MasterProfileId,
        profile_ref: String,
    },
    /// Rendered for and owned by this family alone.
    Individual { profile_ref: String },
}

impl ProfileSource {
    pub fn profile_ref(&self) -> &str {
        match self {
            ProfileSource::Master { profile_ref, .. } | ProfileSource::Individual { profile_ref } => profile_ref,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, ProfileSource::Master { .. })
    }
}

/// Source of a family profile that is about to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewProfileSource {
    Master(MasterProfileId),
    Individual(String),
}

/// Request to create a new family profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyProfileCreateDBRequest {
    pub family_id: FamilyId,
    pub profile_type: ProfileType,
    pub name: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub source: NewProfileSource,
}

/// Request to update an existing family profile. The source is immutable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyProfileUpdateDBRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
}

/// Database representation of a family profile with its source resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyProfileDBResponse {
    pub id: FamilyProfileId,
    pub family_id: FamilyId,
    pub profile_type: ProfileType,
    pub name: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub source: ProfileSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FamilyProfileDBResponse {
    /// The external profile that devices assigned to this profile should receive.
    pub fn external_profile_ref(&self) -> &str {
        self.source.profile_ref()
    }

    pub fn is_shared(&self) -> bool {
        self.source.is_shared()
    }

    pub fn master_profile_id(&self) -> Option<MasterProfileId> {
        match &self.source {
            ProfileSource::Master { master_profile_id, .. } => Some(*master_profile_id),
            ProfileSource::Individual { .. } => None,
        }
    }
}
