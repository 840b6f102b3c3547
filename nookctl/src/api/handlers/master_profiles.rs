use crate::{
    AppState,
    api::models::{master_profiles::MasterProfileResponse, users::CurrentUser},
    auth::permissions::require_admin,
    errors::Result,
    sync::{BootstrapReport, DeleteOutcome},
    types::MasterProfileId,
};
use axum::{
    extract::{Path, State},
    response::Json,
};

#[utoipa::path(
    get,
    path = "/master-profiles",
    tag = "master_profiles",
    summary = "List master profiles",
    description = "The shared predefined profiles, in display order, with their age guidance",
    responses(
        (status = 200, description = "Master profiles", body = [MasterProfileResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_master_profiles(State(state): State<AppState>, _: CurrentUser) -> Result<Json<Vec<MasterProfileResponse>>> {
    let masters = state.coordinator.list_master_profiles().await?;
    Ok(Json(masters.into_iter().map(MasterProfileResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/admin/master-profiles/bootstrap",
    tag = "master_profiles",
    summary = "Bootstrap master profiles",
    description = "Create any missing master profile in the MDM. Safe to run repeatedly.",
    responses(
        (status = 200, description = "Bootstrap report", body = BootstrapReport),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - admins only"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn bootstrap_master_profiles(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<BootstrapReport>> {
    require_admin(&current_user)?;
    let report = state.coordinator.bootstrap_master_profiles().await?;
    Ok(Json(report))
}

#[utoipa::path(
    delete,
    path = "/admin/master-profiles/{master_profile_id}",
    tag = "master_profiles",
    summary = "Delete master profile",
    description = "Delete a master profile that no family uses any more",
    params(
        ("master_profile_id" = uuid::Uuid, Path, description = "Master profile ID")
    ),
    responses(
        (status = 200, description = "Master profile deleted", body = DeleteOutcome),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - admins only"),
        (status = 404, description = "Master profile not found"),
        (status = 409, description = "Conflict - still referenced by family profiles"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn delete_master_profile(
    State(state): State<AppState>,
    Path(master_profile_id): Path<MasterProfileId>,
    current_user: CurrentUser,
) -> Result<Json<DeleteOutcome>> {
    require_admin(&current_user)?;
    let outcome = state.coordinator.delete_master_profile(master_profile_id).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use crate::{
        api::models::master_profiles::MasterProfileResponse,
        sync::{BootstrapReport, DeleteOutcome},
        test_utils::*,
        types::ProfileType,
    };
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    #[test_log::test]
    async fn test_bootstrap_is_idempotent_and_ordered() {
        let app = create_test_app();
        let server = app.server();
        let admin = admin_user();

        let first: BootstrapReport = server.post("/api/v1/admin/master-profiles/bootstrap").as_user(&admin).await.json();
        assert_eq!(first.created, ProfileType::PREDEFINED.to_vec());

        let second: BootstrapReport = server.post("/api/v1/admin/master-profiles/bootstrap").as_user(&admin).await.json();
        assert!(second.created.is_empty());
        assert_eq!(second.existing.len(), 4);
        assert_eq!(app.mdm.calls("create_profile"), 4);

        let masters: Vec<MasterProfileResponse> = server.get("/api/v1/master-profiles").as_user(&parent_user()).await.json();
        let types: Vec<ProfileType> = masters.iter().map(|m| m.profile_type).collect();
        assert_eq!(types, ProfileType::PREDEFINED.to_vec());
        assert_eq!(masters[0].age_range, "Ages 6-10");
    }

    #[tokio::test]
    async fn test_bootstrap_requires_admin() {
        let app = create_test_app();
        let server = app.server();

        server
            .post("/api/v1/admin/master-profiles/bootstrap")
            .as_user(&parent_user())
            .await
            .assert_status(StatusCode::FORBIDDEN);
        assert_eq!(app.mdm.calls("create_profile"), 0);
    }

    #[tokio::test]
    async fn test_delete_master_profile_is_guarded() {
        let app = create_test_app();
        bootstrap(&app).await;
        let server = app.server();
        let admin = admin_user();
        let parent = parent_user();
        let family = create_family_as(&server, &parent, "Smiths").await;
        let profile = assign_profile_as(&server, &parent, family.id, json!({ "profile_type": "time_out" })).await;
        let master_id = profile.master_profile_id.unwrap();

        server
            .delete(&format!("/api/v1/admin/master-profiles/{master_id}"))
            .as_user(&admin)
            .await
            .assert_status(StatusCode::CONFLICT);

        server
            .delete(&format!("/api/v1/profiles/{}", profile.id))
            .as_user(&parent)
            .await
            .assert_status_ok();

        let response = server.delete(&format!("/api/v1/admin/master-profiles/{master_id}")).as_user(&admin).await;
        response.assert_status_ok();
        let outcome: DeleteOutcome = response.json();
        assert!(!outcome.external_cleanup_pending);
        assert!(app.mdm.profile(&profile.external_profile_ref).is_none());
    }
}
