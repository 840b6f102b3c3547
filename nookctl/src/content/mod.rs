//! Profile content generation.
//!
//! The coordinator treats rendered content as an opaque [`ContentBlob`] that is handed straight to
//! the MDM. Rendering is pure: the same type, family name and configuration always produce the
//! same bytes, so re-rendering on update never churns payload identifiers.

use crate::types::ProfileType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use utoipa::ToSchema;

pub mod mobileconfig;

pub use mobileconfig::MobileconfigGenerator;

/// Family name used when rendering shared master profiles.
pub const GLOBAL_FAMILY_NAME: &str = "Global";

/// Rendered configuration payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentBlob(String);

impl ContentBlob {
    pub fn new(content: impl Into<String>) -> Self {
        Self(content.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parent-supplied settings for a custom profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomProfileConfig {
    /// Bundle identifiers of the apps the device may show, e.g. `com.apple.mobilephone`.
    #[serde(default)]
    pub allowed_apps: Vec<String>,
    /// Restriction switches keyed in snake case, e.g. `allow_camera`. Values are booleans,
    /// integers or strings.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub restrictions: BTreeMap<String, serde_json::Value>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("custom profiles require a configuration")]
    MissingConfig,

    #[error("invalid profile configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to render profile content: {0}")]
    Render(String),
}

/// Renders the configuration payload for a profile.
pub trait ProfileContentGenerator: Send + Sync {
    /// `config` is required for [`ProfileType::Custom`] and ignored for predefined types.
    fn render(&self, profile_type: ProfileType, family_name: &str, config: Option<&CustomProfileConfig>) -> Result<ContentBlob, ContentError>;
}
