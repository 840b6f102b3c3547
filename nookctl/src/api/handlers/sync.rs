//! Drift detection and repair between the ledger and the MDM.

use crate::{
    AppState,
    api::handlers::{Access, authorize_family},
    api::models::users::CurrentUser,
    auth::permissions::require_admin,
    errors::Result,
    sync::{BulkReport, RepairReport, SyncReport},
    types::FamilyId,
};
use axum::{
    extract::{Path, State},
    response::Json,
};

#[utoipa::path(
    get,
    path = "/families/{family_id}/sync",
    tag = "sync",
    summary = "Verify family",
    description = "Compare the family's profiles against the links the MDM reports for its device group. Read-only.",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    responses(
        (status = 200, description = "Drift report", body = SyncReport),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
        (status = 409, description = "Family has no device group"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn verify_family(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
) -> Result<Json<SyncReport>> {
    authorize_family(&state, &current_user, family_id, Access::Read).await?;
    let report = state.coordinator.verify(family_id).await?;
    Ok(Json(report))
}

#[utoipa::path(
    post,
    path = "/families/{family_id}/sync/repair",
    tag = "sync",
    summary = "Repair family",
    description = "Re-create every link the ledger expects but the MDM does not report",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    responses(
        (status = 200, description = "Repair report", body = RepairReport),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
        (status = 409, description = "Family has no device group"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn repair_family(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
) -> Result<Json<RepairReport>> {
    authorize_family(&state, &current_user, family_id, Access::Write).await?;
    let report = state.coordinator.repair(family_id).await?;
    Ok(Json(report))
}

#[utoipa::path(
    post,
    path = "/admin/sync",
    tag = "sync",
    summary = "Bulk sync",
    description = "Re-assert every expected profile link for every family. Failures are reported per family.",
    responses(
        (status = 200, description = "Bulk sync report", body = BulkReport),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - admins only"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn bulk_sync(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<BulkReport>> {
    require_admin(&current_user)?;
    let report = state.coordinator.bulk_sync().await?;
    Ok(Json(report))
}
