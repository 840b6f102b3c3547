//! Data-carrying results of coordinator operations.

use crate::mdm::ExternalServiceError;
use crate::types::{FamilyId, FamilyProfileId, ProfileType};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result of a delete. Local deletion always happens; external cleanup may lag behind it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeleteOutcome {
    /// True when at least one MDM cleanup call failed and `repair`/manual cleanup may be needed
    pub external_cleanup_pending: bool,
    pub warnings: Vec<String>,
}

impl DeleteOutcome {
    /// Record a failed cleanup step.
    pub(crate) fn cleanup_failed(&mut self, step: impl std::fmt::Display, err: &ExternalServiceError) {
        self.external_cleanup_pending = true;
        self.warnings.push(format!(
            "deleted locally, but {step} failed in the MDM and may need manual cleanup: {err}"
        ));
        metrics::counter!("nookctl_external_cleanup_failures_total").increment(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// The ledger expects a link the MDM does not report
    MissingExternally,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Discrepancy {
    #[schema(value_type = String, format = "uuid")]
    pub family_profile_id: FamilyProfileId,
    pub external_profile_ref: String,
    pub kind: DiscrepancyKind,
}

/// Drift between the ledger and the MDM for one family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncReport {
    #[schema(value_type = String, format = "uuid")]
    pub family_id: FamilyId,
    pub in_sync: bool,
    /// Number of family profiles checked
    pub checked: usize,
    pub discrepancies: Vec<Discrepancy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RepairResult {
    #[schema(value_type = String, format = "uuid")]
    pub family_profile_id: FamilyProfileId,
    pub repaired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RepairReport {
    #[schema(value_type = String, format = "uuid")]
    pub family_id: FamilyId,
    pub results: Vec<RepairResult>,
    /// True when every discrepancy found was repaired
    pub in_sync_after: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BulkFailure {
    #[schema(value_type = String, format = "uuid")]
    pub family_id: FamilyId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub family_profile_id: Option<FamilyProfileId>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BulkReport {
    pub families_checked: usize,
    pub links_asserted: usize,
    pub failures: Vec<BulkFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BootstrapFailure {
    pub profile_type: ProfileType,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BootstrapReport {
    pub created: Vec<ProfileType>,
    pub existing: Vec<ProfileType>,
    pub failed: Vec<BootstrapFailure>,
}
