//! Caller identity and access control.
//!
//! Authentication happens upstream: an authenticating proxy in front of the service verifies
//! the caller and forwards the result as trusted headers. This module turns those headers into
//! a [`CurrentUser`](crate::api::models::users::CurrentUser) and decides what that caller may do.
//!
//! # Identity headers
//!
//! Header names are configurable under `auth` (see [`crate::config::AuthConfig`]):
//!
//! - `x-nook-user`: the caller's user id (UUID)
//! - `x-nook-role`: `parent`, `child` or `admin`
//! - `x-nook-family`: the family a `child` caller belongs to
//!
//! A missing or malformed identity is rejected with `401 Unauthorized`.
//!
//! # Authorization
//!
//! - **Parents** own the families they created and may read and change them.
//! - **Children** may read the family named in their family header, nothing else.
//! - **Admins** may do anything, including the administrative master profile and sync routes.
//!
//! See [`permissions`] for the individual checks.
//!
//! # Usage in Handlers
//!
//! ```ignore
//! use nookctl::api::models::users::CurrentUser;
//! use nookctl::auth::permissions::require_family_write;
//!
//! async fn rename(State(state): State<AppState>, current_user: CurrentUser, Path(id): Path<FamilyId>) -> Result<()> {
//!     let family = state.coordinator.get_family(id).await?;
//!     require_family_write(&current_user, &family)?;
//!     // ...
//! }
//! ```

pub mod current_user;
pub mod permissions;
