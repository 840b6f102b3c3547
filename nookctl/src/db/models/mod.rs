//! Database record models matching table schemas.
//!
//! This module contains struct definitions that directly correspond to database
//! table rows. These models are used by repositories to return query results
//! and accept insertion/update data.
//!
//! # Design Principles
//!
//! - **Schema Mapping**: Each model struct matches a database table schema
//! - **SQLx Integration**: Row models derive `sqlx::FromRow` for query results
//! - **Separation**: Database models are distinct from API models to allow
//!   independent evolution of storage and API representations
//!
//! # Models
//!
//! - [`families`]: Families and their MDM device group reference
//! - [`master_profiles`]: Globally shared predefined profiles
//! - [`family_profiles`]: Profiles in use by a family, with their resolved source
//! - [`devices`]: Devices and their profile assignment
//! - [`enrollment_codes`]: Short-lived codes that lead a device to its family's enrollment

pub mod devices;
pub mod enrollment_codes;
pub mod families;
pub mod family_profiles;
pub mod master_profiles;
