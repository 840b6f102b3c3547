//! OpenAPI documentation for the management API at `/api/v1/*`.
//!
//! The generated document is served at `/api-docs/openapi.json` and rendered with Scalar at
//! `/docs`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::{api, sync};

/// Security schemes for the identity headers set by the authenticating proxy.
struct IdentityHeadersAddon;

impl Modify for IdentityHeadersAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "X-Nook-User".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-nook-user",
                    "Caller's user id (UUID). Set by the authenticating proxy, never by end users.",
                ))),
            );
            components.security_schemes.insert(
                "X-Nook-Role".to_string(),
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "x-nook-role",
                    "Caller's role: `parent`, `child` or `admin`. Children also send `x-nook-family`.",
                ))),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&IdentityHeadersAddon),
    servers((url = "/api/v1", description = "Management API")),
    paths(
        api::handlers::families::list_families,
        api::handlers::families::create_family,
        api::handlers::families::get_family,
        api::handlers::families::update_family,
        api::handlers::families::delete_family,
        api::handlers::profiles::list_family_profiles,
        api::handlers::profiles::assign_profile,
        api::handlers::profiles::get_profile,
        api::handlers::profiles::update_profile,
        api::handlers::profiles::unassign_profile,
        api::handlers::devices::list_devices,
        api::handlers::devices::register_device,
        api::handlers::devices::get_device,
        api::handlers::devices::reassign_device,
        api::handlers::devices::record_enrollment,
        api::handlers::devices::delete_device,
        api::handlers::devices::lock_device,
        api::handlers::enrollments::issue_enrollment_code,
        api::handlers::enrollments::validate_enrollment_code,
        api::handlers::sync::verify_family,
        api::handlers::sync::repair_family,
        api::handlers::sync::bulk_sync,
        api::handlers::master_profiles::list_master_profiles,
        api::handlers::master_profiles::bootstrap_master_profiles,
        api::handlers::master_profiles::delete_master_profile,
    ),
    components(
        schemas(
            crate::types::ProfileType,
            crate::types::Role,
            crate::content::CustomProfileConfig,
            api::models::users::CurrentUser,
            api::models::families::FamilyCreate,
            api::models::families::FamilyUpdate,
            api::models::families::FamilyResponse,
            api::models::profiles::ProfileAssign,
            api::models::profiles::ProfileUpdate,
            api::models::profiles::ProfileSourceKind,
            api::models::profiles::FamilyProfileResponse,
            api::models::devices::DeviceCreate,
            api::models::devices::DeviceProfileAssignment,
            api::models::devices::DeviceEnrollment,
            api::models::devices::DeviceLock,
            api::models::devices::DeviceResponse,
            api::models::enrollments::EnrollmentCodeResponse,
            api::models::enrollments::EnrollmentValidationResponse,
            api::models::master_profiles::MasterProfileResponse,
            sync::reports::DeleteOutcome,
            sync::reports::DiscrepancyKind,
            sync::reports::Discrepancy,
            sync::reports::SyncReport,
            sync::reports::RepairResult,
            sync::reports::RepairReport,
            sync::reports::BulkFailure,
            sync::reports::BulkReport,
            sync::reports::BootstrapFailure,
            sync::reports::BootstrapReport,
        )
    ),
    tags(
        (name = "families", description = "Families and the MDM device group behind each one."),
        (name = "profiles", description = "Restriction profiles in use by a family.

Predefined types (`first_phone`, `explorer`, `guardian`, `time_out`) are served by one shared master profile each. \
`custom` profiles are rendered from the family's own configuration."),
        (name = "devices", description = "Devices, their enrollment in the MDM and the profile each one receives."),
        (name = "enrollment", description = "Short-lived codes that enroll a new device into a family's device group."),
        (name = "sync", description = "Detect and repair drift between the local assignments and the MDM."),
        (name = "master_profiles", description = "Shared predefined profiles and their one-time bootstrap."),
    ),
    info(
        title = "Nook Control API",
        version = "1.0.0",
        description = "Manage family restriction profiles and keep them in sync with the MDM.

## Authentication

Requests are authenticated upstream. The proxy forwards the caller as `x-nook-user` and `x-nook-role` headers.

## Errors

MDM failures return `503` when retrying may help (with `Retry-After` when known) and `502` otherwise. \
The body carries `message`, `retryable` and `warnings`.",
    ),
)]
pub struct ApiDoc;
