//! Error taxonomy for the ingestion core.
//!
//! Every runtime failure is one of [`HarvestError::Auth`],
//! [`HarvestError::Fetch`] or [`HarvestError::Io`], and is recovered from at
//! the boundary of the operation that produced it. [`HarvestError::InvalidRequest`]
//! signals a configuration or programming fault.

use std::path::PathBuf;

use thiserror::Error;

use crate::modes::ArtifactKind;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Token exchange failed: {0}")]
    Auth(String),
    #[error("Fetch of {kind} for mode '{mode}' failed: {reason}")]
    Fetch {
        mode: String,
        kind: ArtifactKind,
        reason: String,
    },
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HarvestError {
    pub fn fetch(mode: &str, kind: ArtifactKind, reason: impl ToString) -> Self {
        HarvestError::Fetch {
            mode: mode.to_string(),
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HarvestError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly label used in logs and the cycle report.
    pub fn label(&self) -> &'static str {
        match self {
            HarvestError::Auth(_) => "auth_error",
            HarvestError::Fetch { .. } => "fetch_error",
            HarvestError::Io { .. } => "io_error",
            HarvestError::InvalidRequest(_) => "invalid_request",
            HarvestError::Config(_) => "config_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
