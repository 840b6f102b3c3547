//! API layer for HTTP request handling and data models.
//!
//! This module contains the REST API implementation, organized into:
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! Everything lives under `/api/v1`:
//!
//! - **Families** (`/families/*`): create, rename and delete families and their device groups
//! - **Profiles** (`/families/{id}/profiles`, `/profiles/*`): assign, edit and unassign restriction profiles
//! - **Devices** (`/families/{id}/devices`, `/devices/*`): register devices, record enrollment, reassign profiles
//! - **Consistency** (`/families/{id}/sync*`): compare the ledger with the MDM and repair drift
//! - **Administration** (`/master-profiles`, `/admin/*`): master profile bootstrap and bulk sync
//!
//! # OpenAPI Documentation
//!
//! All endpoints are documented with OpenAPI annotations using `utoipa`.
//! The document is served at `/api-docs/openapi.json` and rendered at `/docs`.

pub mod handlers;
pub mod models;
