use crate::{
    AppState,
    api::handlers::{Access, authorize_family, authorize_owned},
    api::models::{
        profiles::{FamilyProfileResponse, ProfileAssign, ProfileUpdate},
        users::CurrentUser,
    },
    errors::Result,
    sync::DeleteOutcome,
    types::{FamilyId, FamilyProfileId},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

#[utoipa::path(
    get,
    path = "/families/{family_id}/profiles",
    tag = "profiles",
    summary = "List family profiles",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    responses(
        (status = 200, description = "Profiles in use by the family", body = [FamilyProfileResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_family_profiles(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
) -> Result<Json<Vec<FamilyProfileResponse>>> {
    authorize_family(&state, &current_user, family_id, Access::Read).await?;
    let profiles = state.coordinator.list_family_profiles(family_id).await?;
    Ok(Json(profiles.into_iter().map(FamilyProfileResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/families/{family_id}/profiles",
    tag = "profiles",
    summary = "Assign profile",
    description = "Add a predefined or custom profile to a family and link it to the family's device group. \
                   Predefined types reuse the shared master profile; custom profiles are created in the MDM first.",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    request_body = ProfileAssign,
    responses(
        (status = 201, description = "Profile assigned", body = FamilyProfileResponse),
        (status = 400, description = "Bad request - invalid name or configuration"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
        (status = 409, description = "Conflict - duplicate type, missing master profile or missing device group"),
        (status = 502, description = "The MDM rejected the profile or link"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn assign_profile(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
    Json(assign): Json<ProfileAssign>,
) -> Result<(StatusCode, Json<FamilyProfileResponse>)> {
    authorize_family(&state, &current_user, family_id, Access::Write).await?;
    let profile = state.coordinator.assign_profile(family_id, assign.into()).await?;
    Ok((StatusCode::CREATED, Json(FamilyProfileResponse::from(profile))))
}

#[utoipa::path(
    get,
    path = "/profiles/{profile_id}",
    tag = "profiles",
    summary = "Get family profile",
    params(
        ("profile_id" = uuid::Uuid, Path, description = "Family profile ID")
    ),
    responses(
        (status = 200, description = "Profile details", body = FamilyProfileResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Profile not found"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_profile(
    State(state): State<AppState>,
    Path(profile_id): Path<FamilyProfileId>,
    current_user: CurrentUser,
) -> Result<Json<FamilyProfileResponse>> {
    let profile = state.coordinator.get_family_profile(profile_id).await?;
    authorize_owned(&state, &current_user, profile.family_id, Access::Read, "family profile", profile_id).await?;
    Ok(Json(FamilyProfileResponse::from(profile)))
}

#[utoipa::path(
    patch,
    path = "/profiles/{profile_id}",
    tag = "profiles",
    summary = "Update family profile",
    description = "Change a profile's name, description or (custom profiles only) configuration. \
                   Custom content is re-rendered and pushed to the MDM before the change is stored.",
    params(
        ("profile_id" = uuid::Uuid, Path, description = "Family profile ID")
    ),
    request_body = ProfileUpdate,
    responses(
        (status = 200, description = "Profile updated", body = FamilyProfileResponse),
        (status = 400, description = "Bad request - configuration supplied for a predefined profile"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Profile not found"),
        (status = 502, description = "The MDM rejected the update"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn update_profile(
    State(state): State<AppState>,
    Path(profile_id): Path<FamilyProfileId>,
    current_user: CurrentUser,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<FamilyProfileResponse>> {
    let existing = state.coordinator.get_family_profile(profile_id).await?;
    authorize_owned(&state, &current_user, existing.family_id, Access::Write, "family profile", profile_id).await?;

    let profile = state.coordinator.update_profile(profile_id, update.into()).await?;
    Ok(Json(FamilyProfileResponse::from(profile)))
}

#[utoipa::path(
    delete,
    path = "/profiles/{profile_id}",
    tag = "profiles",
    summary = "Unassign profile",
    description = "Remove a profile from a family. Devices assigned to it are left without a profile. \
                   Shared master profiles are unlinked, never deleted.",
    params(
        ("profile_id" = uuid::Uuid, Path, description = "Family profile ID")
    ),
    responses(
        (status = 200, description = "Profile removed", body = DeleteOutcome),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Profile not found"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn unassign_profile(
    State(state): State<AppState>,
    Path(profile_id): Path<FamilyProfileId>,
    current_user: CurrentUser,
) -> Result<Json<DeleteOutcome>> {
    let existing = state.coordinator.get_family_profile(profile_id).await?;
    authorize_owned(&state, &current_user, existing.family_id, Access::Write, "family profile", profile_id).await?;

    let outcome = state.coordinator.unassign_profile(profile_id).await?;
    Ok(Json(outcome))
}
