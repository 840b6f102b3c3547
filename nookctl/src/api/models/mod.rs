//! API request and response data models.
//!
//! This module contains the data structures used for HTTP request deserialization
//! and response serialization. These models define the public API contract.
//!
//! # Design Principles
//!
//! - **Separation of Concerns**: API models are distinct from database models,
//!   allowing independent evolution of API and storage representations
//! - **OpenAPI**: All models are annotated with `utoipa` for automatic API docs
//! - **No external plumbing**: responses expose the MDM references a support engineer needs,
//!   never credentials or rendered payloads
//!
//! # Model Categories
//!
//! - [`users`]: The caller identity extracted from the proxy headers
//! - [`families`]: Families and their device group
//! - [`profiles`]: Family profiles (predefined or custom) and their requests
//! - [`devices`]: Device registration, enrollment and profile assignment
//! - [`enrollments`]: Family enrollment codes
//! - [`master_profiles`]: Shared predefined profiles
//!
//! Sync and delete results ([`crate::sync::reports`]) are serialized as they are.

pub mod devices;
pub mod enrollments;
pub mod families;
pub mod master_profiles;
pub mod profiles;
pub mod users;
