//! Error taxonomy for the release pipeline.
//!
//! Every [`ReleaseError`] maps onto an [`ErrorKind`], which is what the
//! pipeline outcome line reports (`Aborted: VersionMismatch`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors produced while verifying and publishing a release tag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReleaseError {
    /// The tag does not follow `v<major>.<minor>.<patch>[-](rc|dev)<n>`.
    #[error("malformed tag '{tag}': {reason}")]
    MalformedTag { tag: String, reason: String },

    /// The tag version and the manifest version differ.
    #[error("tag version '{tag_version}' does not match manifest version '{manifest_version}'")]
    VersionMismatch {
        tag_version: String,
        manifest_version: String,
    },

    /// The manifest could not be read or carries no version.
    #[error("cannot read version from manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    /// The job graph is not a valid DAG (cycle, unknown dependency, ...).
    #[error("invalid job graph: {reason}")]
    InvalidGraph { reason: String },

    /// A job reported failure (or was short-circuited by an upstream failure).
    #[error("job '{name}' failed: {reason}")]
    JobFailure { name: String, reason: String },

    /// Publishing was refused because not every job succeeded.
    #[error("publish denied: blocked by job(s) {}", blocking.join(", "))]
    PublishDenied { blocking: Vec<String> },

    /// The graph succeeded but the build job left no artifact behind.
    #[error("build job '{job}' completed without producing an artifact")]
    MissingArtifact { job: String },

    /// The single upload attempt failed.
    #[error("upload failed: {reason}")]
    UploadFailed { reason: String },

    /// An install attempt failed in a way that may resolve on retry.
    #[error("variant '{variant}' attempt {attempt} failed transiently: {reason}")]
    TransientFailure {
        variant: String,
        attempt: u32,
        reason: String,
    },

    /// A variant cannot be verified: wrong artifact served or budget exhausted.
    #[error("variant '{variant}' failed verification: {reason}")]
    FatalFailure { variant: String, reason: String },
}

impl ReleaseError {
    /// The coarse classification reported in the pipeline outcome.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReleaseError::MalformedTag { .. } => ErrorKind::MalformedTag,
            ReleaseError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            ReleaseError::Manifest { .. } => ErrorKind::Manifest,
            ReleaseError::InvalidGraph { .. } => ErrorKind::InvalidGraph,
            ReleaseError::JobFailure { .. } => ErrorKind::JobFailure,
            ReleaseError::PublishDenied { .. } => ErrorKind::PublishDenied,
            ReleaseError::MissingArtifact { .. } => ErrorKind::MissingArtifact,
            ReleaseError::UploadFailed { .. } => ErrorKind::UploadFailed,
            ReleaseError::TransientFailure { .. } => ErrorKind::TransientFailure,
            ReleaseError::FatalFailure { .. } => ErrorKind::FatalFailure,
        }
    }
}

/// Flat error classification, stable across releases for reports and exit lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedTag,
    VersionMismatch,
    Manifest,
    InvalidGraph,
    JobFailure,
    PublishDenied,
    MissingArtifact,
    UploadFailed,
    TransientFailure,
    FatalFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Debug output is exactly the variant name.
        fmt::Debug::fmt(self, f)
    }
}

/// Result type for release pipeline operations.
pub type Result<T> = std::result::Result<T, ReleaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_names_both_versions() {
        let err = ReleaseError::VersionMismatch {
            tag_version: "2.0.0".to_string(),
            manifest_version: "1.9.9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("2.0.0"));
        assert!(msg.contains("1.9.9"));
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[test]
    fn test_publish_denied_lists_blocking_jobs() {
        let err = ReleaseError::PublishDenied {
            blocking: vec!["lint".to_string(), "test".to_string()],
        };
        assert!(err.to_string().contains("lint, test"));
    }

    #[test]
    fn test_error_kind_display_is_variant_name() {
        assert_eq!(ErrorKind::VersionMismatch.to_string(), "VersionMismatch");
        assert_eq!(ErrorKind::FatalFailure.to_string(), "FatalFailure");
    }
}
