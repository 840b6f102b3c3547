//! Repository implementations for database access.
//!
//! Each repository wraps a SQLx connection or transaction and implements the [`Repository`]
//! trait for one table. Callers start a transaction, build repositories from it, and commit once
//! every write of a ledger operation has succeeded:
//!
//! ```ignore
//! use nookctl::db::handlers::{Families, Repository};
//!
//! let mut tx = pool.begin().await?;
//! let family = Families::new(&mut tx).create(&request).await?;
//! tx.commit().await?;
//! ```
//!
//! # Available Repositories
//!
//! - [`Families`]: Families and their device group reference
//! - [`MasterProfiles`]: Shared predefined profiles
//! - [`FamilyProfiles`]: Per-family profiles with resolved external reference
//! - [`Devices`]: Devices and their profile assignment
//! - [`EnrollmentCodes`]: Enrollment codes, looked up by code

pub mod devices;
pub mod enrollment_codes;
pub mod families;
pub mod family_profiles;
pub mod master_profiles;
pub mod repository;

pub use devices::Devices;
pub use enrollment_codes::EnrollmentCodes;
pub use families::Families;
pub use family_profiles::FamilyProfiles;
pub use master_profiles::MasterProfiles;
pub use repository::Repository;
