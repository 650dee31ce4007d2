//! Error types for configuration loading and reconciliation.

use thiserror::Error;

/// Errors raised while building an [`AgentConfig`](crate::AgentConfig).
///
/// These are per-config: a batch loader logs them and skips the offending
/// entry instead of rejecting the whole fleet configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field is absent or empty.
    #[error("agent config missing '{0}' field")]
    MissingField(&'static str),

    /// Neither `image` nor `imageFamily` was provided.
    #[error("agent config must include 'image' or 'imageFamily'")]
    MissingImage,

    /// Neither `zone` nor a non-empty `zones` list was provided.
    #[error("agent config must include 'zone' or 'zones'")]
    MissingZone,

    /// The agent name leaves no room for the instance-name suffix.
    #[error("agent name '{name}' must be at most {max} characters")]
    NameTooLong { name: String, max: usize },

    /// An earlier entry in the same fleet document already uses this name.
    #[error("agent config name '{0}' is already in use")]
    DuplicateName(String),

    /// The config document could not be decoded.
    #[error("malformed agent config: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Malformed(err.to_string())
    }
}

/// Errors raised while turning a plan into cloud requests.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// A config carries no image after family resolution.
    #[error("agent config '{0}' has no resolved image")]
    UnresolvedImage(String),
}
