//! Client for the external Mobile Device Management service.
//!
//! The MDM owns device groups, configuration profiles and the assignment links between them. Every
//! call is a network round-trip with no transactional guarantees shared with the ledger, so the
//! client's job is narrow: express each operation as an idempotent intent and normalize the
//! failure surface into [`ExternalServiceError`]. It never retries on its own; the coordinator
//! decides what to do with a retryable failure.
//!
//! - [`SimpleMdmClient`]: reqwest implementation against a SimpleMDM-style REST API
//! - [`fake::FakeMdm`]: in-memory implementation for tests

use crate::content::ContentBlob;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod simplemdm;

pub use simplemdm::SimpleMdmClient;

/// A failed call to the MDM.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct ExternalServiceError {
    /// HTTP status returned by the MDM, if a response was received at all.
    pub code: Option<u16>,
    /// Whether the same call may succeed if tried again later.
    pub retryable: bool,
    /// Server-provided backoff hint.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl ExternalServiceError {
    /// A failure with no usable response: timeout, connection refused, DNS.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: None,
            retryable: true,
            retry_after: None,
            message: message.into(),
        }
    }

    /// Classify an HTTP status. Server errors, rate limiting and request timeouts are retryable;
    /// every other non-success status is permanent.
    pub fn from_status(code: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let retryable = code >= 500 || code == 429 || code == 408;
        Self {
            code: Some(code),
            retryable,
            retry_after: if retryable { retry_after } else { None },
            message: message.into(),
        }
    }

    /// A response that arrived but could not be understood.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            code: None,
            retryable: false,
            retry_after: None,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExternalServiceError>;

/// An assignment link between a profile and a device group, as reported by the MDM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupLink {
    pub profile_ref: String,
    pub link_id: String,
}

/// A one-time enrollment created in the MDM for a device group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enrollment {
    pub enrollment_ref: String,
    /// Where the device goes to install the MDM enrollment profile
    pub url: String,
}

/// Intent-level operations against the MDM.
///
/// Link operations are idempotent: linking an existing link and unlinking a missing one both
/// succeed. Deletes of resources that are already gone also succeed.
#[async_trait]
pub trait MdmClient: Send + Sync {
    async fn create_group(&self, name: &str) -> Result<String>;
    async fn rename_group(&self, group_ref: &str, name: &str) -> Result<()>;
    async fn delete_group(&self, group_ref: &str) -> Result<()>;

    async fn create_profile(&self, name: &str, content: &ContentBlob) -> Result<String>;
    async fn update_profile(&self, profile_ref: &str, name: &str, content: &ContentBlob) -> Result<()>;
    async fn delete_profile(&self, profile_ref: &str) -> Result<()>;

    /// Returns the link id. An existing link is reported as success.
    async fn link_profile_to_group(&self, profile_ref: &str, group_ref: &str) -> Result<String>;
    async fn unlink_profile_from_group(&self, profile_ref: &str, group_ref: &str) -> Result<()>;
    async fn link_profile_to_device(&self, profile_ref: &str, device_ref: &str) -> Result<String>;
    async fn unlink_profile_from_device(&self, profile_ref: &str, device_ref: &str) -> Result<()>;

    /// Profiles currently linked to a group. Best effort: may lag recent writes.
    async fn list_group_links(&self, group_ref: &str) -> Result<Vec<GroupLink>>;

    /// Create an enrollment that places the enrolling device into the group.
    async fn create_enrollment(&self, group_ref: &str) -> Result<Enrollment>;
    async fn delete_enrollment(&self, enrollment_ref: &str) -> Result<()>;

    /// Lock the device screen, showing `message` on the lock screen.
    async fn lock_device(&self, device_ref: &str, message: &str) -> Result<()>;
    async fn delete_device(&self, device_ref: &str) -> Result<()>;
}
