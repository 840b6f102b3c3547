//! HTTP request handlers for all API endpoints.
//!
//! This module contains Axum route handlers organized by resource type.
//! Each handler is responsible for:
//! - Request deserialization
//! - Authorization checks against the caller's role and family ownership
//! - Delegating the operation to the [`crate::sync::SyncCoordinator`]
//! - Response serialization
//!
//! Handlers never write ledger rows or call the MDM themselves.
//!
//! # Handler Modules
//!
//! - [`families`]: Family CRUD
//! - [`profiles`]: Assigning, updating and removing family profiles
//! - [`devices`]: Device registration, enrollment, locking, profile assignment and removal
//! - [`enrollments`]: Issuing and validating family enrollment codes
//! - [`sync`]: Drift verification, repair and the bulk re-sync sweep
//! - [`master_profiles`]: Listing, bootstrapping and deleting shared predefined profiles
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`] which automatically converts to
//! appropriate HTTP status codes and error responses.

pub mod devices;
pub mod enrollments;
pub mod families;
pub mod master_profiles;
pub mod profiles;
pub mod sync;

use crate::{
    AppState,
    api::models::users::CurrentUser,
    auth::permissions::{require_family_read, require_family_write},
    db::models::families::FamilyDBResponse,
    errors::{Error, Result},
    types::FamilyId,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

/// Load a family and check the caller may access it.
pub(crate) async fn authorize_family(state: &AppState, current_user: &CurrentUser, family_id: FamilyId, access: Access) -> Result<FamilyDBResponse> {
    let family = state.coordinator.get_family(family_id).await?;
    match access {
        Access::Read => require_family_read(current_user, &family)?,
        Access::Write => require_family_write(current_user, &family)?,
    }
    Ok(family)
}

/// Authorize access to a resource addressed by its own id.
///
/// Callers who cannot read the owning family get the same 404 as for a missing resource, so ids
/// belonging to other families are indistinguishable from unknown ones.
pub(crate) async fn authorize_owned(
    state: &AppState,
    current_user: &CurrentUser,
    family_id: FamilyId,
    access: Access,
    resource: &str,
    id: Uuid,
) -> Result<FamilyDBResponse> {
    let family = state.coordinator.get_family(family_id).await?;
    if require_family_read(current_user, &family).is_err() {
        return Err(Error::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        });
    }
    if access == Access::Write {
        require_family_write(current_user, &family)?;
    }
    Ok(family)
}
