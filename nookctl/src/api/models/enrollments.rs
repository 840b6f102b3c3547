//! API response models for enrollment codes.

use crate::db::models::{enrollment_codes::EnrollmentCodeDBResponse, families::FamilyDBResponse};
use crate::types::{EnrollmentCodeId, FamilyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A freshly issued enrollment code for a family.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnrollmentCodeResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: EnrollmentCodeId,
    #[schema(value_type = String, format = "uuid")]
    pub family_id: FamilyId,
    /// Six digit code a child types on the device
    #[schema(example = "482913")]
    pub code: String,
    /// MDM enrollment URL the code stands for
    pub enrollment_url: String,
    pub expires_at: DateTime<Utc>,
}

impl From<EnrollmentCodeDBResponse> for EnrollmentCodeResponse {
    fn from(db: EnrollmentCodeDBResponse) -> Self {
        Self {
            id: db.id,
            family_id: db.family_id,
            code: db.code,
            enrollment_url: db.enrollment_url,
            expires_at: db.expires_at,
        }
    }
}

/// The family and enrollment URL behind a valid code.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EnrollmentValidationResponse {
    pub valid: bool,
    #[schema(value_type = String, format = "uuid")]
    pub family_id: FamilyId,
    pub family_name: String,
    pub enrollment_url: String,
    pub expires_at: DateTime<Utc>,
}

impl From<(EnrollmentCodeDBResponse, FamilyDBResponse)> for EnrollmentValidationResponse {
    fn from((code, family): (EnrollmentCodeDBResponse, FamilyDBResponse)) -> Self {
        Self {
            valid: true,
            family_id: family.id,
            family_name: family.name,
            enrollment_url: code.enrollment_url,
            expires_at: code.expires_at,
        }
    }
}
