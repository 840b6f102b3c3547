//! The authenticated caller.

use crate::types::{FamilyId, Role, UserId};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Identity of the caller, as asserted by the authenticating proxy.
///
/// Extracted in handlers via [`axum::extract::FromRequestParts`], see
/// [`crate::auth::current_user`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CurrentUser {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub role: Role,
    /// Family a `child` caller belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "uuid")]
    pub family_id: Option<FamilyId>,
}
