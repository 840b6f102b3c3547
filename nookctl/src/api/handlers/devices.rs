use crate::{
    AppState,
    api::handlers::{Access, authorize_family, authorize_owned},
    api::models::{
        devices::{DeleteDeviceQuery, DeviceCreate, DeviceEnrollment, DeviceLock, DeviceProfileAssignment, DeviceResponse},
        users::CurrentUser,
    },
    errors::{Error, Result},
    sync::DeleteOutcome,
    types::{DeviceId, FamilyId},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};

#[utoipa::path(
    get,
    path = "/families/{family_id}/devices",
    tag = "devices",
    summary = "List devices",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    responses(
        (status = 200, description = "Devices of the family", body = [DeviceResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_devices(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
) -> Result<Json<Vec<DeviceResponse>>> {
    authorize_family(&state, &current_user, family_id, Access::Read).await?;
    let devices = state.coordinator.list_devices(family_id).await?;
    Ok(Json(devices.into_iter().map(DeviceResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/families/{family_id}/devices",
    tag = "devices",
    summary = "Register device",
    description = "Register a device that has not enrolled in the MDM yet",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    request_body = DeviceCreate,
    responses(
        (status = 201, description = "Device registered", body = DeviceResponse),
        (status = 400, description = "Bad request - empty name"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register_device(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
    Json(create): Json<DeviceCreate>,
) -> Result<(StatusCode, Json<DeviceResponse>)> {
    authorize_family(&state, &current_user, family_id, Access::Write).await?;
    let device = state.coordinator.register_device(family_id, &create.name).await?;
    Ok((StatusCode::CREATED, Json(DeviceResponse::from(device))))
}

#[utoipa::path(
    get,
    path = "/devices/{device_id}",
    tag = "devices",
    summary = "Get device",
    params(
        ("device_id" = uuid::Uuid, Path, description = "Device ID")
    ),
    responses(
        (status = 200, description = "Device details", body = DeviceResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Device not found"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    current_user: CurrentUser,
) -> Result<Json<DeviceResponse>> {
    let device = state.coordinator.get_device(device_id).await?;
    authorize_owned(&state, &current_user, device.family_id, Access::Read, "device", device_id).await?;
    Ok(Json(DeviceResponse::from(device)))
}

#[utoipa::path(
    put,
    path = "/devices/{device_id}/profile",
    tag = "devices",
    summary = "Assign device profile",
    description = "Change which of its family's profiles a device receives, or clear it with null. \
                   Enrolled devices are relinked in the MDM before the change is stored.",
    params(
        ("device_id" = uuid::Uuid, Path, description = "Device ID")
    ),
    request_body = DeviceProfileAssignment,
    responses(
        (status = 200, description = "Assignment updated", body = DeviceResponse),
        (status = 400, description = "Bad request - profile belongs to another family"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Device or profile not found"),
        (status = 502, description = "The MDM rejected the change"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn reassign_device(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    current_user: CurrentUser,
    Json(assignment): Json<DeviceProfileAssignment>,
) -> Result<Json<DeviceResponse>> {
    let device = state.coordinator.get_device(device_id).await?;
    authorize_owned(&state, &current_user, device.family_id, Access::Write, "device", device_id).await?;

    let device = state.coordinator.reassign_device(device_id, assignment.family_profile_id).await?;
    Ok(Json(DeviceResponse::from(device)))
}

#[utoipa::path(
    put,
    path = "/devices/{device_id}/enrollment",
    tag = "devices",
    summary = "Record enrollment",
    description = "Record the MDM device a registered device enrolled as, and push its assigned profile to it",
    params(
        ("device_id" = uuid::Uuid, Path, description = "Device ID")
    ),
    request_body = DeviceEnrollment,
    responses(
        (status = 200, description = "Enrollment recorded", body = DeviceResponse),
        (status = 400, description = "Bad request - empty device reference"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Device not found"),
        (status = 409, description = "Conflict - the MDM device is already recorded for another device"),
        (status = 502, description = "The MDM rejected the link"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn record_enrollment(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    current_user: CurrentUser,
    Json(enrollment): Json<DeviceEnrollment>,
) -> Result<Json<DeviceResponse>> {
    let external_device_ref = enrollment.external_device_ref.trim();
    if external_device_ref.is_empty() {
        return Err(Error::BadRequest {
            message: "external_device_ref cannot be empty".to_string(),
        });
    }
    let device = state.coordinator.get_device(device_id).await?;
    authorize_owned(&state, &current_user, device.family_id, Access::Write, "device", device_id).await?;

    let device = state.coordinator.record_enrollment(device_id, external_device_ref).await?;
    Ok(Json(DeviceResponse::from(device)))
}

#[utoipa::path(
    delete,
    path = "/devices/{device_id}",
    tag = "devices",
    summary = "Delete device",
    description = "Delete a device. Its profile is unlinked in the MDM, or with `unenroll=true` the device is \
                   removed from the MDM altogether. MDM cleanup failures are reported, never blocking.",
    params(
        ("device_id" = uuid::Uuid, Path, description = "Device ID"),
        DeleteDeviceQuery
    ),
    responses(
        (status = 200, description = "Device deleted", body = DeleteOutcome),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Device not found"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn delete_device(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    Query(query): Query<DeleteDeviceQuery>,
    current_user: CurrentUser,
) -> Result<Json<DeleteOutcome>> {
    let device = state.coordinator.get_device(device_id).await?;
    authorize_owned(&state, &current_user, device.family_id, Access::Write, "device", device_id).await?;

    let outcome = state.coordinator.delete_device(device_id, query.unenroll).await?;
    Ok(Json(outcome))
}

#[utoipa::path(
    post,
    path = "/devices/{device_id}/lock",
    tag = "devices",
    summary = "Lock device",
    description = "Lock an enrolled device's screen through the MDM, showing an optional message",
    params(
        ("device_id" = uuid::Uuid, Path, description = "Device ID")
    ),
    request_body = DeviceLock,
    responses(
        (status = 200, description = "Lock sent", body = DeviceResponse),
        (status = 400, description = "Bad request - device is not enrolled"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Device not found"),
        (status = 502, description = "The MDM rejected the lock"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn lock_device(
    State(state): State<AppState>,
    Path(device_id): Path<DeviceId>,
    current_user: CurrentUser,
    Json(lock): Json<DeviceLock>,
) -> Result<Json<DeviceResponse>> {
    let device = state.coordinator.get_device(device_id).await?;
    authorize_owned(&state, &current_user, device.family_id, Access::Write, "device", device_id).await?;

    let device = state.coordinator.lock_device(device_id, lock.message.as_deref()).await?;
    Ok(Json(DeviceResponse::from(device)))
}

#[cfg(test)]
mod tests {
    use crate::{
        api::models::{devices::DeviceResponse, profiles::FamilyProfileResponse},
        mdm::ExternalServiceError,
        sync::DeleteOutcome,
        test_utils::*,
    };
    use axum::http::StatusCode;
    use serde_json::json;

    struct Setup {
        app: TestApp,
        server: axum_test::TestServer,
        parent: crate::api::models::users::CurrentUser,
        family: crate::api::models::families::FamilyResponse,
        explorer: FamilyProfileResponse,
        guardian: FamilyProfileResponse,
    }

    async fn setup() -> Setup {
        let app = create_test_app();
        bootstrap(&app).await;
        let server = app.server();
        let parent = parent_user();
        let family = create_family_as(&server, &parent, "Smiths").await;
        let explorer = assign_profile_as(&server, &parent, family.id, json!({ "profile_type": "explorer" })).await;
        let guardian = assign_profile_as(&server, &parent, family.id, json!({ "profile_type": "guardian" })).await;
        Setup {
            app,
            server,
            parent,
            family,
            explorer,
            guardian,
        }
    }

    async fn register(s: &Setup, name: &str) -> DeviceResponse {
        let response = s
            .server
            .post(&format!("/api/v1/families/{}/devices", s.family.id))
            .as_user(&s.parent)
            .json(&json!({ "name": name }))
            .await;
        response.assert_status(StatusCode::CREATED);
        response.json()
    }

    #[tokio::test]
    #[test_log::test]
    async fn test_enrollment_pushes_assigned_profile() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;
        assert!(!device.enrolled);

        s.server
            .put(&format!("/api/v1/devices/{}/profile", device.id))
            .as_user(&s.parent)
            .json(&json!({ "family_profile_id": s.explorer.id }))
            .await
            .assert_status_ok();
        assert_eq!(s.app.mdm.calls("link_profile_to_device"), 0, "unenrolled devices only change locally");

        let response = s
            .server
            .put(&format!("/api/v1/devices/{}/enrollment", device.id))
            .as_user(&s.parent)
            .json(&json!({ "external_device_ref": "118234" }))
            .await;
        response.assert_status_ok();
        let enrolled: DeviceResponse = response.json();
        assert!(enrolled.enrolled);
        assert!(s.app.mdm.is_linked_to_device(&s.explorer.external_profile_ref, "118234"));
    }

    #[tokio::test]
    async fn test_reassign_enrolled_device_moves_link() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;
        s.server
            .put(&format!("/api/v1/devices/{}/profile", device.id))
            .as_user(&s.parent)
            .json(&json!({ "family_profile_id": s.explorer.id }))
            .await
            .assert_status_ok();
        s.server
            .put(&format!("/api/v1/devices/{}/enrollment", device.id))
            .as_user(&s.parent)
            .json(&json!({ "external_device_ref": "118234" }))
            .await
            .assert_status_ok();

        let response = s
            .server
            .put(&format!("/api/v1/devices/{}/profile", device.id))
            .as_user(&s.parent)
            .json(&json!({ "family_profile_id": s.guardian.id }))
            .await;
        response.assert_status_ok();
        let moved: DeviceResponse = response.json();
        assert_eq!(moved.assigned_family_profile_id, Some(s.guardian.id));
        assert!(s.app.mdm.is_linked_to_device(&s.guardian.external_profile_ref, "118234"));
        assert!(!s.app.mdm.is_linked_to_device(&s.explorer.external_profile_ref, "118234"));
    }

    #[tokio::test]
    async fn test_reassign_to_other_family_profile_is_rejected() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;
        let other = create_family_as(&s.server, &s.parent, "Joneses").await;
        let foreign = assign_profile_as(&s.server, &s.parent, other.id, json!({ "profile_type": "explorer" })).await;

        s.server
            .put(&format!("/api/v1/devices/{}/profile", device.id))
            .as_user(&s.parent)
            .json(&json!({ "family_profile_id": foreign.id }))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_enrollment_link_failure_stores_nothing() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;
        s.server
            .put(&format!("/api/v1/devices/{}/profile", device.id))
            .as_user(&s.parent)
            .json(&json!({ "family_profile_id": s.explorer.id }))
            .await
            .assert_status_ok();
        s.app
            .mdm
            .fail_next("link_profile_to_device", ExternalServiceError::from_status(503, "maintenance", None));

        s.server
            .put(&format!("/api/v1/devices/{}/enrollment", device.id))
            .as_user(&s.parent)
            .json(&json!({ "external_device_ref": "118234" }))
            .await
            .assert_status(StatusCode::SERVICE_UNAVAILABLE);

        let fetched: DeviceResponse = s.server.get(&format!("/api/v1/devices/{}", device.id)).as_user(&s.parent).await.json();
        assert!(!fetched.enrolled);
    }

    #[tokio::test]
    async fn test_delete_device_with_unenroll() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;
        s.server
            .put(&format!("/api/v1/devices/{}/enrollment", device.id))
            .as_user(&s.parent)
            .json(&json!({ "external_device_ref": "118234" }))
            .await
            .assert_status_ok();

        let response = s
            .server
            .delete(&format!("/api/v1/devices/{}?unenroll=true", device.id))
            .as_user(&s.parent)
            .await;
        response.assert_status_ok();
        let outcome: DeleteOutcome = response.json();
        assert!(!outcome.external_cleanup_pending);
        assert_eq!(s.app.mdm.deleted_devices(), vec!["118234".to_string()]);

        let remaining: Vec<DeviceResponse> = s
            .server
            .get(&format!("/api/v1/families/{}/devices", s.family.id))
            .as_user(&s.parent)
            .await
            .json();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn test_other_parent_cannot_touch_device() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;
        let stranger = parent_user();

        // Another family's device looks exactly like a missing one
        for id in [device.id, uuid::Uuid::new_v4()] {
            s.server
                .get(&format!("/api/v1/devices/{id}"))
                .as_user(&stranger)
                .await
                .assert_status_not_found();
            s.server
                .delete(&format!("/api/v1/devices/{id}"))
                .as_user(&stranger)
                .await
                .assert_status_not_found();
        }
        s.server
            .get(&format!("/api/v1/devices/{}", device.id))
            .as_user(&s.parent)
            .await
            .assert_status_ok();
    }

    #[tokio::test]
    async fn test_lock_enrolled_device() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;
        s.server
            .put(&format!("/api/v1/devices/{}/enrollment", device.id))
            .as_user(&s.parent)
            .json(&json!({ "external_device_ref": "118234" }))
            .await
            .assert_status_ok();

        s.server
            .post(&format!("/api/v1/devices/{}/lock", device.id))
            .as_user(&s.parent)
            .json(&json!({ "message": "Homework first" }))
            .await
            .assert_status_ok();
        s.server
            .post(&format!("/api/v1/devices/{}/lock", device.id))
            .as_user(&s.parent)
            .json(&json!({}))
            .await
            .assert_status_ok();

        assert_eq!(
            s.app.mdm.locks(),
            vec![
                ("118234".to_string(), "Homework first".to_string()),
                ("118234".to_string(), crate::sync::DEFAULT_LOCK_MESSAGE.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_requires_enrollment_and_write_access() {
        let s = setup().await;
        let device = register(&s, "Sam's iPhone").await;

        s.server
            .post(&format!("/api/v1/devices/{}/lock", device.id))
            .as_user(&s.parent)
            .json(&json!({}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        s.server
            .post(&format!("/api/v1/devices/{}/lock", device.id))
            .as_user(&child_user(s.family.id))
            .json(&json!({}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        assert!(s.app.mdm.locks().is_empty());
    }

}
