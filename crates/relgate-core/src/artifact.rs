//! The built distributable and the builder seam that produces it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::scheduler::{JobExecutor, JobOutcome};
use crate::version::Version;

/// An opaque built package plus the version it was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// File name as it will appear on the index, e.g. `demo-1.2.3.tar.gz`.
    pub file_name: String,
    pub version: Version,
    pub payload: Vec<u8>,
    /// Lowercase hex SHA-256 of `payload`.
    pub digest: String,
}

impl Artifact {
    pub fn new(file_name: impl Into<String>, version: Version, payload: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&payload));
        Self {
            file_name: file_name.into(),
            version,
            payload,
            digest,
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Metadata without the payload, for reports and logs.
    pub fn info(&self) -> ArtifactInfo {
        ArtifactInfo {
            file_name: self.file_name.clone(),
            version: self.version,
            digest: self.digest.clone(),
            size: self.size() as u64,
        }
    }
}

/// Serializable summary of an [`Artifact`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub file_name: String,
    pub version: Version,
    pub digest: String,
    pub size: u64,
}

/// Errors from an [`ArtifactBuilder`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("build failed: {0}")]
pub struct BuildError(pub String);

/// Source tree → built package. Opaque to the pipeline.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, version: &Version) -> Result<Artifact, BuildError>;
}

/// Adapts an [`ArtifactBuilder`] into a graph job.
///
/// The job succeeds when the builder returns an artifact; the artifact is
/// parked in a one-shot slot that the pipeline drains after the graph resolves.
pub struct BuildJob {
    builder: Arc<dyn ArtifactBuilder>,
    version: Version,
    slot: Arc<Mutex<Option<Artifact>>>,
}

impl BuildJob {
    pub fn new(builder: Arc<dyn ArtifactBuilder>, version: Version) -> Self {
        Self {
            builder,
            version,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle to the slot, kept by the pipeline before the job is moved into
    /// the executor map.
    pub fn slot(&self) -> Arc<Mutex<Option<Artifact>>> {
        Arc::clone(&self.slot)
    }
}

#[async_trait]
impl JobExecutor for BuildJob {
    async fn run(&self) -> JobOutcome {
        match self.builder.build(&self.version).await {
            Ok(artifact) if artifact.version.to_string() != self.version.to_string() => {
                JobOutcome::failure(format!(
                    "builder produced version {} but {} was requested",
                    artifact.version, self.version
                ))
            }
            Ok(artifact) => {
                *self.slot.lock().await = Some(artifact);
                JobOutcome::Success
            }
            Err(e) => JobOutcome::failure(e.to_string()),
        }
    }
}
