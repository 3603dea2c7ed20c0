//! Error types for stepbox-spec.

use crate::capability::{Capability, Platform};
use thiserror::Error;

/// Result type alias for spec assembly.
pub type Result<T> = std::result::Result<T, SpecError>;

/// Errors that can occur while assembling an execution spec.
#[derive(Debug, Error)]
pub enum SpecError {
    /// A requested optional feature has no support on the active platform.
    #[error("no support for {capability} on {platform}")]
    Unsupported {
        /// The capability that was requested
        capability: Capability,
        /// The platform that denied it
        platform: Platform,
    },

    /// The path of the running executable could not be determined.
    #[error("getting executable path: {0}")]
    Executable(#[source] std::io::Error),

    /// Platform name that does not match any known platform.
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SpecError {
    /// The capability named by an unsupported-feature error, if this is one.
    pub fn unsupported_capability(&self) -> Option<Capability> {
        match self {
            SpecError::Unsupported { capability, .. } => Some(*capability),
            _ => None,
        }
    }
}
