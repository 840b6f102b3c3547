//! Database models for families.

use crate::types::{FamilyId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to create a new family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyCreateDBRequest {
    pub name: String,
    pub parent_id: UserId,
    /// MDM device group backing this family. Set when the group is created before the row.
    pub external_group_ref: Option<String>,
}

/// Request to update an existing family
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyUpdateDBRequest {
    pub name: Option<String>,
    pub external_group_ref: Option<String>,
}

/// Database representation of a family
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FamilyDBResponse {
    pub id: FamilyId,
    pub name: String,
    pub parent_id: UserId,
    pub external_group_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
