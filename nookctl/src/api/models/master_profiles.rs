//! API response models for master profiles.

use crate::db::models::master_profiles::MasterProfileDBResponse;
use crate::types::{MasterProfileId, ProfileType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A shared predefined profile with its display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MasterProfileResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: MasterProfileId,
    pub profile_type: ProfileType,
    #[schema(example = "Explorer")]
    pub name: String,
    pub description: Option<String>,
    #[schema(example = "Ages 10-14")]
    pub age_range: String,
    pub external_profile_ref: String,
    pub created_at: DateTime<Utc>,
}

impl From<MasterProfileDBResponse> for MasterProfileResponse {
    fn from(db: MasterProfileDBResponse) -> Self {
        Self {
            id: db.id,
            age_range: db.profile_type.age_range().to_string(),
            profile_type: db.profile_type,
            name: db.name,
            description: db.description,
            external_profile_ref: db.external_profile_ref,
            created_at: db.created_at,
        }
    }
}
