//! relgate core library
//!
//! Verifies a release tag against the project manifest, runs the release job
//! graph, publishes the built artifact to a staging index, and checks that it
//! installs.

pub mod artifact;
pub mod consistency;
pub mod error;
pub mod fakes;
pub mod graph;
pub mod index;
pub mod manifest;
pub mod metrics;
pub mod obs;
pub mod pipeline;
pub mod publish;
pub mod scheduler;
pub mod telemetry;
pub mod verify;
pub mod version;

pub use artifact::{Artifact, ArtifactBuilder, ArtifactInfo, BuildError, BuildJob};
pub use consistency::validate;
pub use error::{ErrorKind, ReleaseError, Result};
pub use graph::{JobGraph, JobGraphBuilder, JobSpec};
pub use index::{
    default_variants, IndexError, InstallError, InstallRequest, InstalledPackage, PackageIndex,
    Variant,
};
pub use manifest::read_manifest_version;
pub use pipeline::{
    PipelineOutcome, PipelineReport, PipelineRun, ReleasePipeline, Stage, StageReport,
};
pub use publish::{PublishReceipt, Publisher};
pub use scheduler::{
    ExecutorMap, FailureCause, GateVerdict, GraphRun, JobExecutor, JobOutcome, JobReport,
    JobState, Scheduler, SchedulerConfig,
};
pub use verify::{
    classify_all_transient, classify_strict, AttemptOutcome, ErrorClass, InstallVerifier,
    RetryPolicy, VariantReport, VerificationAttempt, VerificationReport,
};
pub use version::{parse_tag, Suffix, SuffixKind, TrailingPolicy, Version};

pub use metrics::{MetricsSnapshot, METRICS};
pub use telemetry::init_tracing;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
