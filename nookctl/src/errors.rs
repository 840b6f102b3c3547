use crate::db::errors::DbError;
use crate::ledger::LedgerError;
use crate::mdm::ExternalServiceError;
use crate::sync::SyncError;
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Caller's role or ownership does not allow the operation
    #[error("Insufficient permissions to {action} {resource}")]
    InsufficientPermissions { action: String, resource: String },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Conflicts with current state: duplicates, missing bootstrap, guarded deletes
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The MDM call behind this request failed
    #[error("External service error: {source}")]
    External {
        source: ExternalServiceError,
        warnings: Vec<String>,
    },

    /// A new individual profile could not be created in the MDM
    #[error("Profile creation failed: {source}")]
    ProfileCreationFailed { source: ExternalServiceError },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::InsufficientPermissions { .. } => StatusCode::FORBIDDEN,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::External { source, .. } => {
                if source.retryable {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            Error::ProfileCreationFailed { .. } => StatusCode::BAD_GATEWAY,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::CheckViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::ProtectedEntity { .. } => StatusCode::CONFLICT,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InsufficientPermissions { action, resource } => {
                format!("Insufficient permissions to {action} {resource}")
            }
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => {
                format!("{resource} with ID {id} not found")
            }
            Error::Conflict { message } => message.clone(),
            Error::External { source, .. } => {
                if source.retryable {
                    "The device management service is temporarily unavailable, please try again".to_string()
                } else {
                    format!("The device management service rejected the request: {}", source.message)
                }
            }
            Error::ProfileCreationFailed { source } => {
                format!("The profile could not be created in the device management service: {}", source.message)
            }
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { constraint, table, .. } => match (table.as_deref(), constraint.as_deref()) {
                    (Some("devices"), Some(c)) if c.contains("external_device_ref") => {
                        "This device is already enrolled in another record".to_string()
                    }
                    (Some("family_profiles"), _) => "The family already has a profile of this type".to_string(),
                    _ => "Resource already exists".to_string(),
                },
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::ProtectedEntity {
                    operation,
                    entity_type,
                    reason,
                    ..
                } => {
                    format!("Cannot {operation:?} {entity_type}: {reason}")
                }
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::External { .. } | Error::ProfileCreationFailed { .. } => {
                tracing::warn!("External service error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::InsufficientPermissions { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Conflict { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
        }

        let status = self.status_code();
        let message = self.user_message();

        match self {
            Error::External { source, warnings } => {
                let body = json!({
                    "message": message,
                    "retryable": source.retryable,
                    "warnings": warnings,
                });
                let mut response = (status, axum::response::Json(body)).into_response();
                if let Some(retry_after) = source.retry_after
                    && let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().max(1).to_string())
                {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            Error::ProfileCreationFailed { source } => {
                let body = json!({
                    "message": message,
                    "retryable": source.retryable,
                    "warnings": Vec::<String>::new(),
                });
                (status, axum::response::Json(body)).into_response()
            }
            Error::Conflict { .. } => (status, axum::response::Json(json!({ "message": message }))).into_response(),
            // For all other errors, return simple text message
            _ => (status, message).into_response(),
        }
    }
}

impl From<SyncError> for Error {
    fn from(err: SyncError) -> Self {
        let warnings = err.warnings();
        match err {
            SyncError::Validation(message) => Error::BadRequest { message },
            SyncError::NotFound { entity, id } => Error::NotFound {
                resource: entity.to_string(),
                id: id.to_string(),
            },
            SyncError::Conflict(message) => Error::Conflict { message },
            e @ (SyncError::NotBootstrapped(_) | SyncError::MissingGroupReference(_)) => Error::Conflict { message: e.to_string() },
            SyncError::External { source, .. } => Error::External { source, warnings },
            SyncError::ProfileCreationFailed { source } => Error::ProfileCreationFailed { source },
            SyncError::Content(e) => Error::Other(anyhow::Error::new(e)),
            SyncError::Ledger(LedgerError::Db(db)) => Error::Database(db),
            SyncError::Ledger(other) => Error::Other(anyhow::Error::new(other)),
        }
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
