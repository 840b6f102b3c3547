use crate::{
    AppState,
    api::handlers::{Access, authorize_family},
    api::models::{
        families::{FamilyCreate, FamilyResponse, FamilyUpdate, ListFamiliesQuery},
        users::CurrentUser,
    },
    auth::permissions::{can_create_family, is_admin},
    errors::{Error, Result},
    sync::DeleteOutcome,
    types::{FamilyId, Role},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "Family name cannot be empty".to_string(),
        });
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/families",
    tag = "families",
    summary = "List families",
    description = "Parents see the families they own, children see their own family and admins see all families",
    params(ListFamiliesQuery),
    responses(
        (status = 200, description = "List of families", body = [FamilyResponse]),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - only admins may filter by another parent"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_families(
    State(state): State<AppState>,
    Query(query): Query<ListFamiliesQuery>,
    current_user: CurrentUser,
) -> Result<Json<Vec<FamilyResponse>>> {
    let families = match current_user.role {
        Role::Admin => state.coordinator.list_families(query.parent_id).await?,
        Role::Parent => {
            if query.parent_id.is_some_and(|id| id != current_user.id) {
                return Err(Error::InsufficientPermissions {
                    action: "list".to_string(),
                    resource: "families of another parent".to_string(),
                });
            }
            state.coordinator.list_families(Some(current_user.id)).await?
        }
        Role::Child => match current_user.family_id {
            Some(family_id) => vec![authorize_family(&state, &current_user, family_id, Access::Read).await?],
            None => Vec::new(),
        },
    };

    Ok(Json(families.into_iter().map(FamilyResponse::from).collect()))
}

#[utoipa::path(
    post,
    path = "/families",
    tag = "families",
    summary = "Create family",
    description = "Create a family and its device group in the MDM",
    request_body = FamilyCreate,
    responses(
        (status = 201, description = "Family created", body = FamilyResponse),
        (status = 400, description = "Bad request - empty name"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden - children cannot create families"),
        (status = 502, description = "The MDM rejected the device group"),
        (status = 503, description = "The MDM is temporarily unavailable"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_family(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(create): Json<FamilyCreate>,
) -> Result<(StatusCode, Json<FamilyResponse>)> {
    if !can_create_family(&current_user) {
        return Err(Error::InsufficientPermissions {
            action: "create".to_string(),
            resource: "families".to_string(),
        });
    }
    validate_name(&create.name)?;

    let parent_id = match create.parent_id {
        Some(parent_id) if parent_id != current_user.id && !is_admin(&current_user) => {
            return Err(Error::InsufficientPermissions {
                action: "create".to_string(),
                resource: format!("families for user {parent_id}"),
            });
        }
        Some(parent_id) => parent_id,
        None => current_user.id,
    };

    let family = state.coordinator.create_family(parent_id, create.name.trim()).await?;
    Ok((StatusCode::CREATED, Json(FamilyResponse::from(family))))
}

#[utoipa::path(
    get,
    path = "/families/{family_id}",
    tag = "families",
    summary = "Get family",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    responses(
        (status = 200, description = "Family details", body = FamilyResponse),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_family(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
) -> Result<Json<FamilyResponse>> {
    let family = authorize_family(&state, &current_user, family_id, Access::Read).await?;
    Ok(Json(FamilyResponse::from(family)))
}

#[utoipa::path(
    patch,
    path = "/families/{family_id}",
    tag = "families",
    summary = "Rename family",
    description = "Rename a family and its device group in the MDM",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    request_body = FamilyUpdate,
    responses(
        (status = 200, description = "Family renamed", body = FamilyResponse),
        (status = 400, description = "Bad request - empty name"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
        (status = 502, description = "The MDM rejected the rename"),
        (status = 503, description = "The MDM is temporarily unavailable"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn update_family(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
    Json(update): Json<FamilyUpdate>,
) -> Result<Json<FamilyResponse>> {
    validate_name(&update.name)?;
    authorize_family(&state, &current_user, family_id, Access::Write).await?;

    let family = state.coordinator.rename_family(family_id, update.name.trim()).await?;
    Ok(Json(FamilyResponse::from(family)))
}

#[utoipa::path(
    delete,
    path = "/families/{family_id}",
    tag = "families",
    summary = "Delete family",
    description = "Delete a family with its profiles and devices. MDM cleanup is best-effort; \
                   failures are reported in the response instead of blocking the delete.",
    params(
        ("family_id" = uuid::Uuid, Path, description = "Family ID")
    ),
    responses(
        (status = 200, description = "Family deleted", body = DeleteOutcome),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Forbidden"),
        (status = 404, description = "Family not found"),
        (status = 500, description = "Internal server error"),
    ),
    security(
        ("X-Nook-User" = [], "X-Nook-Role" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn delete_family(
    State(state): State<AppState>,
    Path(family_id): Path<FamilyId>,
    current_user: CurrentUser,
) -> Result<Json<DeleteOutcome>> {
    authorize_family(&state, &current_user, family_id, Access::Write).await?;
    let outcome = state.coordinator.delete_family(family_id).await?;
    Ok(Json(outcome))
}
