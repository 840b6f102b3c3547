//! Keeping the assignment ledger and the MDM in step.
//!
//! [`SyncCoordinator`] is the only component that talks to both the [`AssignmentLedger`] and the
//! [`MdmClient`]. Route handlers call its transitions and never write ledger rows themselves.
//!
//! # Ordering
//!
//! - **Create**: external side effect first, ledger row second. The ledger is never ahead of the
//!   MDM for a new link.
//! - **Delete**: external cleanup first, ledger delete second regardless of how the cleanup went.
//!   Failed cleanup is reported through [`DeleteOutcome`], never as an error.
//!
//! A crash between the two phases leaves a recoverable inconsistency that [`SyncCoordinator::verify`]
//! detects and [`SyncCoordinator::repair`] / [`SyncCoordinator::bulk_sync`] fix.
//!
//! [`AssignmentLedger`]: crate::ledger::AssignmentLedger
//! [`MdmClient`]: crate::mdm::MdmClient

mod coordinator;
pub mod error;
pub mod reports;

pub use coordinator::{AssignProfile, DEFAULT_LOCK_MESSAGE, ProfileChanges, SyncCoordinator};
pub use error::SyncError;
pub use reports::{BootstrapReport, BulkReport, DeleteOutcome, RepairReport, SyncReport};
