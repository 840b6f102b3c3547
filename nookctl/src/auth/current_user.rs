use crate::{
    AppState,
    api::models::users::CurrentUser,
    config::AuthConfig,
    errors::{Error, Result},
    types::{Role, abbrev_uuid},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

/// Read a header as a trimmed string. Non-UTF-8 values count as absent.
fn header_value<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn unauthenticated(message: impl Into<String>) -> Error {
    Error::Unauthenticated {
        message: Some(message.into()),
    }
}

/// Build the caller identity from the trusted proxy headers.
#[instrument(skip(parts, config))]
fn identity_from_headers(parts: &Parts, config: &AuthConfig) -> Result<CurrentUser> {
    let raw_id = header_value(parts, &config.user_header).ok_or_else(|| unauthenticated(format!("Missing {} header", config.user_header)))?;
    let id = Uuid::parse_str(raw_id).map_err(|_| unauthenticated(format!("Invalid user id in {} header", config.user_header)))?;

    let role = header_value(parts, &config.role_header)
        .ok_or_else(|| unauthenticated(format!("Missing {} header", config.role_header)))?
        .parse::<Role>()
        .map_err(unauthenticated)?;

    let family_id = match header_value(parts, &config.family_header) {
        Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| unauthenticated(format!("Invalid family id in {} header", config.family_header)))?),
        None => None,
    };

    if role == Role::Child && family_id.is_none() {
        return Err(unauthenticated(format!("Child callers must send the {} header", config.family_header)));
    }

    Ok(CurrentUser { id, role, family_id })
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        match identity_from_headers(parts, &state.config.auth) {
            Ok(user) => {
                debug!("Authenticated user {} as {:?}", abbrev_uuid(&user.id), user.role);
                Ok(user)
            }
            Err(e) => {
                trace!("Header authentication failed: {:?}", e);
                Err(e)
            }
        }
    }
}
