//! API request/response models for family profiles.

use crate::content::CustomProfileConfig;
use crate::db::models::family_profiles::{FamilyProfileDBResponse, ProfileSource};
use crate::sync::{AssignProfile, ProfileChanges};
use crate::types::{FamilyId, FamilyProfileId, MasterProfileId, ProfileType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request body for adding a profile to a family.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProfileAssign {
    pub profile_type: ProfileType,
    /// Defaults to the type's display name
    #[schema(example = "Weekend rules")]
    pub name: Option<String>,
    pub description: Option<String>,
    /// Required for `custom`, rejected for predefined types
    pub config: Option<CustomProfileConfig>,
}

impl From<ProfileAssign> for AssignProfile {
    fn from(req: ProfileAssign) -> Self {
        Self {
            profile_type: req.profile_type,
            name: req.name,
            description: req.description,
            config: req.config,
        }
    }
}

/// Request body for updating a family profile. All fields are optional; only provided fields
/// are changed. `config` is accepted for custom profiles only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<CustomProfileConfig>,
}

impl From<ProfileUpdate> for ProfileChanges {
    fn from(req: ProfileUpdate) -> Self {
        Self {
            name: req.name,
            description: req.description,
            config: req.config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSourceKind {
    /// Served by the shared master profile of its type
    Master,
    /// Rendered for and owned by this family
    Individual,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FamilyProfileResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: FamilyProfileId,
    #[schema(value_type = String, format = "uuid")]
    pub family_id: FamilyId,
    pub profile_type: ProfileType,
    pub name: String,
    pub description: Option<String>,
    #[schema(value_type = Object)]
    pub config: serde_json::Value,
    pub source: ProfileSourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub master_profile_id: Option<MasterProfileId>,
    /// Profile in the MDM that devices assigned to this profile receive
    pub external_profile_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FamilyProfileDBResponse> for FamilyProfileResponse {
    fn from(db: FamilyProfileDBResponse) -> Self {
        let (source, master_profile_id, external_profile_ref) = match db.source {
            ProfileSource::Master {
                master_profile_id,
                profile_ref,
            } => (ProfileSourceKind::Master, Some(master_profile_id), profile_ref),
            ProfileSource::Individual { profile_ref } => (ProfileSourceKind::Individual, None, profile_ref),
        };
        Self {
            id: db.id,
            family_id: db.family_id,
            profile_type: db.profile_type,
            name: db.name,
            description: db.description,
            config: db.config,
            source,
            master_profile_id,
            external_profile_ref,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}
