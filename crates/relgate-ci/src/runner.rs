//! Process execution with timeouts, and the command-backed job executor.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relgate_core::{JobExecutor, JobOutcome};
use tokio::process::Command;
use tracing::debug;

use crate::job::JobInstance;

/// Errors from launching or waiting on a command.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("command for '{name}' is empty")]
    EmptyCommand { name: String },

    #[error("failed to run '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{name}' timed out after {}s", after.as_secs())]
    TimedOut { name: String, after: Duration },
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    /// First element is the executable.
    pub argv: Vec<String>,
    /// `Duration::ZERO` disables the timeout.
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            timeout: Duration::ZERO,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub name: String,
    /// Exit code; -1 when killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub success: bool,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Short failure description: exit code plus the last stderr line.
    pub fn failure_summary(&self) -> String {
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => format!("exit code {}: {}", self.exit_code, line.trim()),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

pub struct CommandRunner;

impl CommandRunner {
    /// Run `spec` to completion, capturing output. The child is killed if
    /// the timeout fires.
    pub async fn run(spec: &CommandSpec) -> Result<CommandOutput, RunError> {
        let start = Instant::now();

        let Some((exe, args)) = spec.argv.split_first() else {
            return Err(RunError::EmptyCommand {
                name: spec.name.clone(),
            });
        };
        let io_err = |source: std::io::Error| RunError::Io {
            name: spec.name.clone(),
            source,
        };

        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        debug!(command = %spec.name, argv = ?spec.argv, "spawning");
        let child = command.spawn().map_err(io_err)?;

        let output = if spec.timeout.is_zero() {
            child.wait_with_output().await.map_err(io_err)?
        } else {
            tokio::time::timeout(spec.timeout, child.wait_with_output())
                .await
                .map_err(|_| RunError::TimedOut {
                    name: spec.name.clone(),
                    after: spec.timeout,
                })?
                .map_err(io_err)?
        };

        Ok(CommandOutput {
            name: spec.name.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }
}

/// A graph job that runs one command.
#[derive(Debug, Clone)]
pub struct CommandJob {
    spec: CommandSpec,
}

impl CommandJob {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }

    pub fn from_instance(instance: &JobInstance, cwd: Option<PathBuf>) -> Self {
        Self::new(CommandSpec {
            name: instance.name.clone(),
            argv: instance.command.clone(),
            timeout: Duration::from_secs(instance.timeout_secs),
            env: instance.env.clone(),
            cwd,
        })
    }
}

#[async_trait]
impl JobExecutor for CommandJob {
    async fn run(&self) -> JobOutcome {
        match CommandRunner::run(&self.spec).await {
            Ok(output) if output.passed() => JobOutcome::Success,
            Ok(output) => JobOutcome::failure(output.failure_summary()),
            Err(e) => JobOutcome::failure(e.to_string()),
        }
    }
}
