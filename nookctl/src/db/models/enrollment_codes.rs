//! Database models for enrollment codes.

use crate::types::{EnrollmentCodeId, FamilyId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request to store a freshly issued enrollment code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentCodeCreateDBRequest {
    pub family_id: FamilyId,
    pub code: String,
    pub external_enrollment_ref: String,
    pub enrollment_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Database representation of an enrollment code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EnrollmentCodeDBResponse {
    pub id: EnrollmentCodeId,
    pub family_id: FamilyId,
    pub code: String,
    pub external_enrollment_ref: String,
    pub enrollment_url: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl EnrollmentCodeDBResponse {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
