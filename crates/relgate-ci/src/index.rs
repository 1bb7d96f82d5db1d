//! Package index driven by configured upload/install/smoke commands.
//!
//! Command lines may use `{artifact}`, `{index_url}`, `{spec}`, `{package}`
//! and `{version}`. The install command is expected to create a fresh
//! environment; the smoke command runs inside it and prints the version the
//! installed package reports as its last stdout line.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use relgate_core::{
    Artifact, IndexError, InstallError, InstallRequest, InstalledPackage, PackageIndex,
};
use tracing::debug;

use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunError};
use crate::template::render_argv;

#[derive(Debug, Clone)]
pub struct CommandIndex {
    pub url: String,
    pub publish: Vec<String>,
    pub install: Vec<String>,
    pub smoke: Vec<String>,
    pub root: PathBuf,
    pub timeout: Duration,
}

impl CommandIndex {
    fn spec(&self, name: &str, template: &[String], vars: &[(&str, &str)]) -> CommandSpec {
        CommandSpec::new(name, render_argv(template, vars))
            .with_timeout(self.timeout)
            .with_cwd(&self.root)
    }
}

/// Map a failed install command onto the install error taxonomy by its output.
pub fn classify_install_output(output: &CommandOutput) -> InstallError {
    let text = format!("{}\n{}", output.stderr, output.stdout).to_lowercase();
    let summary = output.failure_summary();
    if text.contains("connection refused") || text.contains("failed to establish a new connection")
    {
        InstallError::ConnectionRefused(summary)
    } else if text.contains("no matching distribution")
        || text.contains("could not find a version")
        || text.contains("not found in the package registry")
    {
        InstallError::NotYetAvailable(summary)
    } else {
        InstallError::Failed(summary)
    }
}

fn install_error(e: RunError) -> InstallError {
    match e {
        RunError::TimedOut { after, .. } => InstallError::Timeout {
            after_ms: after.as_millis() as u64,
        },
        other => InstallError::Failed(other.to_string()),
    }
}

#[async_trait]
impl PackageIndex for CommandIndex {
    fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, package: &str, artifact: &Artifact) -> Result<(), IndexError> {
        // Upload tools want a file on disk.
        let staging = tempfile::tempdir().map_err(|e| IndexError::Transport(e.to_string()))?;
        let path = staging.path().join(&artifact.file_name);
        tokio::fs::write(&path, &artifact.payload)
            .await
            .map_err(|e| IndexError::Transport(e.to_string()))?;

        let path_str = path.display().to_string();
        let version = artifact.version.to_string();
        let spec = self.spec(
            "publish",
            &self.publish,
            &[
                ("artifact", path_str.as_str()),
                ("index_url", self.url.as_str()),
                ("package", package),
                ("version", version.as_str()),
            ],
        );

        let output = CommandRunner::run(&spec)
            .await
            .map_err(|e| IndexError::Transport(e.to_string()))?;
        if output.passed() {
            return Ok(());
        }
        let text = output.stderr.to_lowercase();
        if text.contains("already exists") || text.contains("file exists") {
            Err(IndexError::AlreadyExists {
                package: package.to_string(),
                version,
            })
        } else {
            Err(IndexError::Rejected(output.failure_summary()))
        }
    }

    async fn install(&self, request: &InstallRequest) -> Result<InstalledPackage, InstallError> {
        let requirement = request.requirement();
        let version = request.version.to_string();
        let vars = [
            ("spec", requirement.as_str()),
            ("index_url", self.url.as_str()),
            ("package", request.package.as_str()),
            ("version", version.as_str()),
        ];

        let install = self.spec("install", &self.install, &vars);
        let output = CommandRunner::run(&install).await.map_err(install_error)?;
        if !output.passed() {
            return Err(classify_install_output(&output));
        }

        let smoke = self.spec("smoke", &self.smoke, &vars);
        let output = CommandRunner::run(&smoke).await.map_err(install_error)?;
        if !output.passed() {
            return Err(InstallError::Failed(format!(
                "smoke check failed: {}",
                output.failure_summary()
            )));
        }

        let reported = output
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();
        debug!(variant = %request.variant, reported = %reported, "smoke check finished");
        Ok(InstalledPackage {
            reported_version: reported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::{Variant, Version};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn index(root: PathBuf, publish: &str, install: &str, smoke: &str) -> CommandIndex {
        CommandIndex {
            url: "https://staging.example/simple".into(),
            publish: sh(publish),
            install: sh(install),
            smoke: sh(smoke),
            root,
            timeout: Duration::from_secs(30),
        }
    }

    fn request() -> InstallRequest {
        InstallRequest {
            package: "demo".into(),
            variant: Variant::with_extras("core+audio", vec!["audio".into()]),
            version: Version::final_release(2, 0, 0),
        }
    }

    fn output(stderr: &str) -> CommandOutput {
        CommandOutput {
            name: "install".into(),
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
            duration_ms: 1,
            success: false,
        }
    }

    #[test]
    fn test_classify_install_output() {
        assert!(matches!(
            classify_install_output(&output(
                "ERROR: No matching distribution found for demo==2.0.0"
            )),
            InstallError::NotYetAvailable(_)
        ));
        assert!(matches!(
            classify_install_output(&output("[Errno 111] Connection refused")),
            InstallError::ConnectionRefused(_)
        ));
        assert!(matches!(
            classify_install_output(&output("error: subprocess-exited-with-error")),
            InstallError::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_publish_passes_artifact_path() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(
            dir.path().to_path_buf(),
            "cp {artifact} uploaded.tar.gz",
            "true",
            "true",
        );
        let artifact = Artifact::new(
            "demo-2.0.0.tar.gz",
            Version::final_release(2, 0, 0),
            b"bytes".to_vec(),
        );

        idx.publish("demo", &artifact).await.unwrap();
        let uploaded = std::fs::read(dir.path().join("uploaded.tar.gz")).unwrap();
        assert_eq!(uploaded, b"bytes");
    }

    #[tokio::test]
    async fn test_publish_duplicate_detected() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(
            dir.path().to_path_buf(),
            "echo 'HTTPError: 400 File already exists' >&2; exit 1",
            "true",
            "true",
        );
        let artifact = Artifact::new("demo-2.0.0.tar.gz", Version::final_release(2, 0, 0), vec![]);

        let err = idx.publish("demo", &artifact).await.unwrap_err();
        assert!(matches!(err, IndexError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_install_and_smoke_report_version() {
        let dir = tempfile::tempdir().unwrap();
        let idx = index(
            dir.path().to_path_buf(),
            "true",
            "echo {spec} > requested",
            "echo importing; echo {version}",
        );

        let installed = idx.install(&request()).await.unwrap();
        assert_eq!(installed.reported_version, "2.0.0");
        let requested = std::fs::read_to_string(dir.path().join("requested")).unwrap();
        assert_eq!(requested.trim(), "demo[audio]==2.0.0");
    }

    #[tokio::test]
    async fn test_install_timeout_maps_to_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = index(dir.path().to_path_buf(), "true", "sleep 5", "true");
        idx.timeout = Duration::from_millis(100);

        let err = idx.install(&request()).await.unwrap_err();
        assert_eq!(err, InstallError::Timeout { after_ms: 100 });
    }
}
