//! relgate CI - command-backed release collaborators
//!
//! Provides the process-level side of the release pipeline:
//! - `relgate.toml` configuration with matrix job expansion
//! - Command execution with timeouts as graph jobs
//! - A build command that produces the artifact
//! - Upload/install/smoke commands as the package index

pub mod builder;
pub mod config;
pub mod index;
pub mod job;
pub mod runner;
pub mod template;

// Re-export key types
pub use builder::CommandBuilder;
pub use config::{ReleaseConfig, DEFAULT_CONFIG_FILE, INDEX_URL_ENV};
pub use index::CommandIndex;
pub use job::{JobConfig, JobInstance, MatrixConfig, DEPENDENCY_TIER_ENV, RUNTIME_ENV};
pub use runner::{CommandJob, CommandOutput, CommandRunner, CommandSpec, RunError};
