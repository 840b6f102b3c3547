//! Common type definitions shared across the ledger, sync and API layers.
//!
//! # ID Types
//!
//! All entity IDs are UUIDs wrapped in type aliases:
//!
//! - [`FamilyId`]: Family (household) identifier
//! - [`FamilyProfileId`]: A profile in use by one family
//! - [`MasterProfileId`]: A globally shared predefined profile
//! - [`DeviceId`]: Enrolled (or enrolling) device identifier
//! - [`EnrollmentCodeId`]: An issued enrollment code
//! - [`UserId`]: Caller identity as asserted by the fronting identity provider
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

// Type aliases for IDs
pub type FamilyId = Uuid;
pub type FamilyProfileId = Uuid;
pub type MasterProfileId = Uuid;
pub type DeviceId = Uuid;
pub type EnrollmentCodeId = Uuid;
pub type UserId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// The kind of a profile.
///
/// The four predefined types are served from a shared master profile in the MDM. `Custom`
/// profiles are rendered per family from their own configuration and owned by that family alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    FirstPhone,
    Explorer,
    Guardian,
    TimeOut,
    Custom,
}

impl ProfileType {
    /// Every type that has a shared master profile.
    pub const PREDEFINED: [ProfileType; 4] = [ProfileType::FirstPhone, ProfileType::Explorer, ProfileType::Guardian, ProfileType::TimeOut];

    pub fn is_custom(&self) -> bool {
        matches!(self, ProfileType::Custom)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileType::FirstPhone => "first_phone",
            ProfileType::Explorer => "explorer",
            ProfileType::Guardian => "guardian",
            ProfileType::TimeOut => "time_out",
            ProfileType::Custom => "custom",
        }
    }

    /// Human-readable name, used for master profile names and default family profile names.
    pub fn display_name(&self) -> &'static str {
        match self {
            ProfileType::FirstPhone => "First Phone",
            ProfileType::Explorer => "Explorer",
            ProfileType::Guardian => "Guardian",
            ProfileType::TimeOut => "Time Out",
            ProfileType::Custom => "Custom",
        }
    }

    /// Default description shown alongside a master profile.
    pub fn default_description(&self) -> &'static str {
        match self {
            ProfileType::FirstPhone => "Basic phone for young kids getting their first phone - Phone and Messages only",
            ProfileType::Explorer => "Enhanced features for kids ready for more but still supervised - Camera, YouTube Kids, Maps included",
            ProfileType::Guardian => "Full access with social media protection - All apps except dangerous social platforms",
            ProfileType::TimeOut => "Disciplinary mode - Phone only when rules are broken",
            ProfileType::Custom => "Custom profile with personalized restrictions",
        }
    }

    pub fn age_range(&self) -> &'static str {
        match self {
            ProfileType::FirstPhone => "Ages 6-10",
            ProfileType::Explorer => "Ages 10-14",
            ProfileType::Guardian => "Ages 12-16",
            ProfileType::TimeOut | ProfileType::Custom => "Any age",
        }
    }
}

impl std::str::FromStr for ProfileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first_phone" => Ok(ProfileType::FirstPhone),
            "explorer" => Ok(ProfileType::Explorer),
            "guardian" => Ok(ProfileType::Guardian),
            "time_out" => Ok(ProfileType::TimeOut),
            "custom" => Ok(ProfileType::Custom),
            other => Err(format!("unknown profile type '{other}'")),
        }
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role asserted for the caller by the fronting identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Child,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parent" => Ok(Role::Parent),
            "child" => Ok(Role::Child),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Parent => "parent",
            Role::Child => "child",
            Role::Admin => "admin",
        })
    }
}

// Operations that a protection rule can forbid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
}
