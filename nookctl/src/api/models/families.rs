//! API request/response models for families.

use crate::db::models::families::FamilyDBResponse;
use crate::types::{FamilyId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Query parameters for listing families
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListFamiliesQuery {
    /// Only list families owned by this parent. Admins only; parents always see their own.
    #[param(value_type = Option<String>, format = "uuid")]
    pub parent_id: Option<UserId>,
}

/// Request body for creating a new family.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FamilyCreate {
    #[schema(example = "The Smiths")]
    pub name: String,
    /// Owner of the new family. Admins only; parents always create families for themselves.
    #[serde(default)]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub parent_id: Option<UserId>,
}

/// Request body for renaming a family.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FamilyUpdate {
    #[schema(example = "The Smith-Joneses")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FamilyResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: FamilyId,
    pub name: String,
    #[schema(value_type = String, format = "uuid")]
    pub parent_id: UserId,
    /// Device group backing this family in the MDM
    pub external_group_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<FamilyDBResponse> for FamilyResponse {
    fn from(db: FamilyDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            parent_id: db.parent_id,
            external_group_ref: db.external_group_ref,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}
