use crate::content::ContentError;
use crate::ledger::LedgerError;
use crate::mdm::ExternalServiceError;
use crate::types::{FamilyId, ProfileType};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by [`super::SyncCoordinator`] operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Rejected before any state change
    #[error("{0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    /// The request collides with existing state (duplicate type, master profile in use)
    #[error("{0}")]
    Conflict(String),

    /// A predefined type was requested before its master profile exists
    #[error("no master profile exists for {0}; run the master profile bootstrap first")]
    NotBootstrapped(ProfileType),

    /// The family has no device group in the MDM, so nothing can be linked to it
    #[error("family {0} has no device group in the MDM")]
    MissingGroupReference(FamilyId),

    /// An MDM call failed. `orphan_cleanup` is set when a compensating delete of a freshly
    /// created profile also failed.
    #[error("MDM call failed: {source}")]
    External {
        #[source]
        source: ExternalServiceError,
        orphan_cleanup: Option<ExternalServiceError>,
    },

    /// Creating an individual profile in the MDM failed; nothing was persisted
    #[error("failed to create profile in the MDM: {source}")]
    ProfileCreationFailed {
        #[source]
        source: ExternalServiceError,
    },

    /// Profile content could not be produced from otherwise valid input
    #[error(transparent)]
    Content(ContentError),

    #[error(transparent)]
    Ledger(LedgerError),
}

impl SyncError {
    pub(crate) fn external(source: ExternalServiceError) -> Self {
        SyncError::External { source, orphan_cleanup: None }
    }

    /// The underlying MDM failure, if this error came from the MDM.
    pub fn external_source(&self) -> Option<&ExternalServiceError> {
        match self {
            SyncError::External { source, .. } | SyncError::ProfileCreationFailed { source } => Some(source),
            _ => None,
        }
    }

    /// Non-fatal problems that accompanied the error.
    pub fn warnings(&self) -> Vec<String> {
        match self {
            SyncError::External {
                orphan_cleanup: Some(cleanup),
                ..
            } => vec![format!(
                "the newly created MDM profile could not be removed and may need manual cleanup: {cleanup}"
            )],
            _ => Vec::new(),
        }
    }
}

impl From<LedgerError> for SyncError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { entity, id } => SyncError::NotFound { entity, id },
            LedgerError::CrossFamilyProfile { .. } | LedgerError::InvalidProfileSource(_) => SyncError::Validation(err.to_string()),
            LedgerError::DuplicateProfileType { .. }
            | LedgerError::MasterProfileExists(_)
            | LedgerError::MasterProfileInUse { .. }
            | LedgerError::DuplicateEnrollmentCode => SyncError::Conflict(err.to_string()),
            LedgerError::Db(_) => SyncError::Ledger(err),
        }
    }
}

impl From<ContentError> for SyncError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::MissingConfig | ContentError::InvalidConfig(_) => SyncError::Validation(err.to_string()),
            ContentError::Render(_) => SyncError::Content(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_family_is_validation() {
        let err: SyncError = LedgerError::CrossFamilyProfile {
            family_id: Uuid::new_v4(),
            profile_id: Uuid::new_v4(),
        }
        .into();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_orphan_cleanup_surfaces_as_warning() {
        let err = SyncError::External {
            source: ExternalServiceError::transport("timed out"),
            orphan_cleanup: Some(ExternalServiceError::from_status(500, "boom", None)),
        };
        assert_eq!(err.warnings().len(), 1);
        assert!(SyncError::external(ExternalServiceError::transport("timed out")).warnings().is_empty());
    }
}
