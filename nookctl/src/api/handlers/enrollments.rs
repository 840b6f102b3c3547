use crate::{
    AppState,
    api::handlers::{Access, authorize_family},
    api::models::{
        enrollments::{EnrollmentCodeResponse, EnrollmentValidationResponse},
        users::CurrentUser,
    },
    errors::Result,
    types::FamilyId,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};

#[utoipa::path(
    post,
    path = "/families/{family_id}/enroll",
    tag = "enrollment",
    summary = "Issue enrollment code",
    description = "Create an MDM enrollment for the family's device group and return a six digit code for it. \
                   Codes are valid for 24 hours.",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    responses(
        (status = 201, description = "Code issued", body = EnrollmentCodeResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
        (status = 409, description = "Conflict - the family has no device group"),
        (status = 502, description = "The MDM rejected the enrollment"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn issue_enrollment_code(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
) -> Result<(StatusCode, Json<EnrollmentCodeResponse>)> {
    authorize_family(&state, &current_user, family_id, Access::Write).await?;
    let code = state.coordinator.issue_enrollment_code(family_id).await?;
    Ok((StatusCode::CREATED, Json(EnrollmentCodeResponse::from(code))))
}

#[utoipa::path(
    get,
    path = "/enroll/validate/{code}",
    tag = "enrollment",
    summary = "Validate enrollment code",
    description = "Resolve an enrollment code to its family and enrollment URL. \
                   Called from the device being enrolled, so no identity headers are required.",
    params(
        ("code" = String, Path, description = "Six digit enrollment code")
    ),
    responses(
        (status = 200, description = "Code is valid", body = EnrollmentValidationResponse),
        (status = 400, description = "Bad request - malformed, unknown or expired code"),
    ),
)]
#[tracing::instrument(skip_all)]
pub async fn validate_enrollment_code(State(state): State<AppState>, Path(code): Path<String>) -> Result<Json<EnrollmentValidationResponse>> {
    let resolved = state.coordinator.validate_enrollment_code(&code).await?;
    Ok(Json(EnrollmentValidationResponse::from(resolved)))
}
