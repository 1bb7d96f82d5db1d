//! The distribution index seam: upload an artifact, install a package spec.
//!
//! Inject a real implementation that shells out to packaging tools, or the
//! in-memory [`crate::fakes::MemoryIndex`] for tests.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::artifact::Artifact;
use crate::version::Version;

/// Upload-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// Same version already published; the index refuses duplicates.
    #[error("{package} {version} already exists on the index")]
    AlreadyExists { package: String, version: String },

    #[error("index rejected the upload: {0}")]
    Rejected(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Install-side failures, before classification by the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstallError {
    #[error("install timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The index answered but does not list the version yet.
    #[error("version not yet available: {0}")]
    NotYetAvailable(String),

    #[error("install failed: {0}")]
    Failed(String),
}

/// A named installation flavour: the core package plus optional extras.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(default)]
    pub extras: Vec<String>,
}

impl Variant {
    pub fn core() -> Self {
        Self {
            name: "core".to_string(),
            extras: Vec::new(),
        }
    }

    pub fn with_extras(name: impl Into<String>, extras: Vec<String>) -> Self {
        Self {
            name: name.into(),
            extras,
        }
    }

    /// Requirement string, e.g. `demo[audio,plot]==1.2.3`.
    pub fn requirement(&self, package: &str, version: &Version) -> String {
        if self.extras.is_empty() {
            format!("{package}=={version}")
        } else {
            format!("{package}[{}]=={version}", self.extras.join(","))
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The standard ordered variant list for a package with optional `groups`:
/// `core`, then `core+<group>` for each group, then `core+all`.
pub fn default_variants(groups: &[String]) -> Vec<Variant> {
    let mut variants = vec![Variant::core()];
    for group in groups {
        variants.push(Variant::with_extras(
            format!("core+{group}"),
            vec![group.clone()],
        ));
    }
    if groups.len() > 1 {
        variants.push(Variant::with_extras("core+all", groups.to_vec()));
    }
    variants
}

/// Everything an index needs to attempt one install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub package: String,
    pub variant: Variant,
    pub version: Version,
}

impl InstallRequest {
    pub fn requirement(&self) -> String {
        self.variant.requirement(&self.package, &self.version)
    }
}

/// Result of a successful install plus smoke check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    /// Version the installed package reported about itself.
    pub reported_version: String,
}

/// A remote package index with upload and install endpoints.
#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Base URL, recorded in receipts.
    fn url(&self) -> &str;

    /// Upload `artifact` for `package`. Called at most once per run.
    async fn publish(&self, package: &str, artifact: &Artifact) -> Result<(), IndexError>;

    /// Install the request in a fresh environment, import it, and report the
    /// version it claims to be.
    async fn install(&self, request: &InstallRequest) -> Result<InstalledPackage, InstallError>;
}
