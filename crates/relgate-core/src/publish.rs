//! Gated upload to the staging index.
//!
//! The [`Publisher`] refuses to upload unless the job graph verdict is green,
//! and makes exactly one upload attempt. Propagation delay is the verifier's
//! problem, not a reason to re-upload.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::Artifact;
use crate::error::{ReleaseError, Result};
use crate::index::PackageIndex;
use crate::metrics::METRICS;
use crate::obs;
use crate::scheduler::GateVerdict;
use crate::version::Version;

/// Proof of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub package: String,
    pub version: Version,
    pub file_name: String,
    pub digest: String,
    pub index_url: String,
    pub published_at: DateTime<Utc>,
}

/// Uploads artifacts for one package to one index.
pub struct Publisher {
    package: String,
    index: Arc<dyn PackageIndex>,
}

impl Publisher {
    pub fn new(package: impl Into<String>, index: Arc<dyn PackageIndex>) -> Self {
        Self {
            package: package.into(),
            index,
        }
    }

    /// Upload `artifact` if and only if `gate.passed`.
    ///
    /// The caller keeps ownership of the artifact so it can be retained for
    /// postmortem if anything later in the run fails.
    pub async fn publish(&self, artifact: &Artifact, gate: &GateVerdict) -> Result<PublishReceipt> {
        if !gate.passed {
            warn!(
                event = "publish.denied",
                package = %self.package,
                blocking = ?gate.blocking,
            );
            return Err(ReleaseError::PublishDenied {
                blocking: gate.blocking.clone(),
            });
        }

        info!(
            event = "publish.uploading",
            package = %self.package,
            file = %artifact.file_name,
            index = %self.index.url(),
        );
        METRICS.inc_uploads();

        self.index
            .publish(&self.package, artifact)
            .await
            .map_err(|e| ReleaseError::UploadFailed {
                reason: e.to_string(),
            })?;

        let version = artifact.version.to_string();
        obs::emit_artifact_uploaded(&self.package, &version, &artifact.digest);

        Ok(PublishReceipt {
            package: self.package.clone(),
            version: artifact.version,
            file_name: artifact.file_name.clone(),
            digest: artifact.digest.clone(),
            index_url: self.index.url().to_string(),
            published_at: Utc::now(),
        })
    }
}
