//! Artifact builder that shells out to the project's packaging command.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use relgate_core::{Artifact, ArtifactBuilder, BuildError, Version};
use tracing::info;

use crate::runner::{CommandRunner, CommandSpec};
use crate::template::{render, render_argv};

/// Runs the build command, then reads the artifact it wrote.
///
/// Placeholders `{package}` and `{version}` are substituted in both the
/// command and the artifact path. A relative artifact path is resolved
/// against `root`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    pub package: String,
    pub command: Vec<String>,
    pub artifact: String,
    pub root: PathBuf,
    pub timeout: Duration,
}

impl CommandBuilder {
    fn vars<'a>(&'a self, version: &'a str) -> [(&'a str, &'a str); 2] {
        [("package", self.package.as_str()), ("version", version)]
    }

    pub fn artifact_path(&self, version: &Version) -> PathBuf {
        let version = version.to_string();
        self.root.join(render(&self.artifact, &self.vars(&version)))
    }
}

#[async_trait]
impl ArtifactBuilder for CommandBuilder {
    async fn build(&self, version: &Version) -> Result<Artifact, BuildError> {
        let version_str = version.to_string();
        let spec = CommandSpec::new("build", render_argv(&self.command, &self.vars(&version_str)))
            .with_timeout(self.timeout)
            .with_cwd(&self.root);

        let output = CommandRunner::run(&spec)
            .await
            .map_err(|e| BuildError(e.to_string()))?;
        if !output.passed() {
            return Err(BuildError(output.failure_summary()));
        }

        let path = self.artifact_path(version);
        let payload = tokio::fs::read(&path)
            .await
            .map_err(|e| BuildError(format!("cannot read artifact {}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| BuildError(format!("artifact path {} has no file name", path.display())))?;

        let artifact = Artifact::new(file_name, *version, payload);
        info!(event = "build.artifact", file = %artifact.file_name, bytes = artifact.size());
        Ok(artifact)
    }
}
