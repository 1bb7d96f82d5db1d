//! End-to-end release pipeline: tag → version → consistency → jobs → publish → verify.
//!
//! Stages run strictly in order and the first failing stage aborts the run.
//! Each stage appends to a [`PipelineReport`] that is threaded through by
//! value; the finished report is returned together with the terminal outcome.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::artifact::{Artifact, ArtifactBuilder, ArtifactInfo, BuildJob};
use crate::consistency;
use crate::error::{ErrorKind, ReleaseError};
use crate::graph::JobGraph;
use crate::index::{PackageIndex, Variant};
use crate::manifest::read_manifest_version;
use crate::metrics::METRICS;
use crate::obs;
use crate::publish::{PublishReceipt, Publisher};
use crate::scheduler::{ExecutorMap, GateVerdict, JobExecutor, JobReport, Scheduler, SchedulerConfig};
use crate::verify::{InstallVerifier, RetryPolicy, VerificationReport};
use crate::version::{parse_tag, TrailingPolicy, Version};

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ParseTag,
    ValidateVersion,
    Jobs,
    Publish,
    Verify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ParseTag => "parse_tag",
            Stage::ValidateVersion => "validate_version",
            Stage::Jobs => "jobs",
            Stage::Publish => "publish",
            Stage::Verify => "verify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub passed: bool,
    pub diagnostic: String,
    pub duration_ms: u64,
}

/// Terminal result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    PublishedAndVerified,
    Aborted { kind: ErrorKind, diagnostic: String },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::PublishedAndVerified)
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::PublishedAndVerified => f.write_str("Published&Verified"),
            PipelineOutcome::Aborted { kind, .. } => write!(f, "Aborted: {kind}"),
        }
    }
}

/// Everything recorded about one run. Serializable for `--report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub tag: String,
    pub version: Option<Version>,
    pub manifest_version: Option<String>,
    pub graph_digest: String,
    pub stages: Vec<StageReport>,
    pub jobs: Vec<JobReport>,
    pub artifact: Option<ArtifactInfo>,
    pub receipt: Option<PublishReceipt>,
    pub verification: Option<VerificationReport>,
    pub outcome: PipelineOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PipelineReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// A finished run: the report, the terminal error if any, and the artifact
/// when the run failed after it was built.
#[derive(Debug)]
pub struct PipelineRun {
    pub report: PipelineReport,
    pub error: Option<ReleaseError>,
    pub retained_artifact: Option<Artifact>,
}

impl PipelineRun {
    pub fn succeeded(&self) -> bool {
        self.report.outcome.is_success()
    }
}

/// Report under construction. Consumed and returned by every stage.
#[derive(Debug)]
struct Progress {
    run_id: String,
    tag: String,
    started_at: DateTime<Utc>,
    version: Option<Version>,
    manifest_version: Option<String>,
    graph_digest: String,
    stages: Vec<StageReport>,
    jobs: Vec<JobReport>,
    artifact: Option<ArtifactInfo>,
    receipt: Option<PublishReceipt>,
    verification: Option<VerificationReport>,
}

impl Progress {
    fn record(mut self, stage: Stage, passed: bool, diagnostic: String, started: Instant) -> Self {
        obs::emit_stage_finished(stage.as_str(), passed, &diagnostic);
        self.stages.push(StageReport {
            stage,
            passed,
            diagnostic,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        self
    }

    fn finish(self, outcome: PipelineOutcome) -> PipelineReport {
        PipelineReport {
            run_id: self.run_id,
            tag: self.tag,
            version: self.version,
            manifest_version: self.manifest_version,
            graph_digest: self.graph_digest,
            stages: self.stages,
            jobs: self.jobs,
            artifact: self.artifact,
            receipt: self.receipt,
            verification: self.verification,
            outcome,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// A stage failure carrying the report so far.
struct Aborted {
    progress: Progress,
    error: ReleaseError,
    artifact: Option<Artifact>,
}

impl Aborted {
    fn at(
        progress: Progress,
        stage: Stage,
        started: Instant,
        error: ReleaseError,
        artifact: Option<Artifact>,
    ) -> Self {
        let progress = progress.record(stage, false, error.to_string(), started);
        Self {
            progress,
            error,
            artifact,
        }
    }
}

type StageResult<T> = std::result::Result<T, Box<Aborted>>;

/// The configured pipeline. Reusable across tags; holds no per-run state.
pub struct ReleasePipeline {
    package: String,
    manifest_path: PathBuf,
    trailing: TrailingPolicy,
    graph: JobGraph,
    executors: ExecutorMap,
    build_job: String,
    builder: Arc<dyn ArtifactBuilder>,
    index: Arc<dyn PackageIndex>,
    scheduler: SchedulerConfig,
    variants: Vec<Variant>,
    retry: RetryPolicy,
    parallel_verify: bool,
}

impl ReleasePipeline {
    pub fn new(
        package: impl Into<String>,
        manifest_path: impl Into<PathBuf>,
        graph: JobGraph,
        builder: Arc<dyn ArtifactBuilder>,
        index: Arc<dyn PackageIndex>,
    ) -> Self {
        Self {
            package: package.into(),
            manifest_path: manifest_path.into(),
            trailing: TrailingPolicy::default(),
            graph,
            executors: ExecutorMap::new(),
            build_job: "build".to_string(),
            builder,
            index,
            scheduler: SchedulerConfig::default(),
            variants: vec![Variant::core()],
            retry: RetryPolicy::default(),
            parallel_verify: false,
        }
    }

    /// Register the executor for a non-build job.
    pub fn with_executor(mut self, job: impl Into<String>, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.insert(job.into(), executor);
        self
    }

    pub fn with_executors(mut self, executors: ExecutorMap) -> Self {
        self.executors.extend(executors);
        self
    }

    /// Name of the graph job whose executor is the artifact builder.
    pub fn with_build_job(mut self, job: impl Into<String>) -> Self {
        self.build_job = job.into();
        self
    }

    pub fn with_trailing_policy(mut self, policy: TrailingPolicy) -> Self {
        self.trailing = policy;
        self
    }

    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
        self.variants = variants;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_parallel_verify(mut self, parallel: bool) -> Self {
        self.parallel_verify = parallel;
        self
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    /// Run every stage for `tag`. Never panics on stage failure; the outcome
    /// is in the returned report.
    pub async fn run(&self, tag: &str) -> PipelineRun {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::pipeline_span(&run_id, tag);
        self.run_with_id(run_id, tag).instrument(span).await
    }

    async fn run_with_id(&self, run_id: String, tag: &str) -> PipelineRun {
        let clock = Instant::now();
        let metrics_start = METRICS.snapshot();
        obs::emit_pipeline_started(&run_id, tag);

        let progress = Progress {
            run_id: run_id.clone(),
            tag: tag.to_string(),
            started_at: Utc::now(),
            version: None,
            manifest_version: None,
            graph_digest: self.graph.digest(),
            stages: Vec::new(),
            jobs: Vec::new(),
            artifact: None,
            receipt: None,
            verification: None,
        };
        info!(event = "pipeline.graph", digest = %progress.graph_digest, jobs = self.graph.len());

        let run = match self.execute(progress).await {
            Ok(progress) => PipelineRun {
                report: progress.finish(PipelineOutcome::PublishedAndVerified),
                error: None,
                retained_artifact: None,
            },
            Err(aborted) => {
                let Aborted {
                    progress,
                    error,
                    artifact,
                } = *aborted;
                PipelineRun {
                    report: progress.finish(PipelineOutcome::Aborted {
                        kind: error.kind(),
                        diagnostic: error.to_string(),
                    }),
                    error: Some(error),
                    retained_artifact: artifact,
                }
            }
        };

        obs::emit_pipeline_finished(
            &run_id,
            &run.report.outcome,
            clock.elapsed().as_millis() as u64,
        );
        METRICS.flush_since(&metrics_start);
        run
    }

    async fn execute(&self, progress: Progress) -> StageResult<Progress> {
        let (progress, version) = self.parse_stage(progress)?;
        let progress = self.validate_stage(progress, &version)?;
        let (progress, artifact, verdict) = self.jobs_stage(progress, &version).await?;
        let (progress, artifact) = self.publish_stage(progress, artifact, &verdict).await?;
        self.verify_stage(progress, &version, artifact).await
    }

    fn parse_stage(&self, progress: Progress) -> StageResult<(Progress, Version)> {
        let started = Instant::now();
        match parse_tag(&progress.tag, self.trailing) {
            Ok(version) => {
                let mut progress = progress.record(Stage::ParseTag, true, version.to_string(), started);
                progress.version = Some(version);
                Ok((progress, version))
            }
            Err(e) => Err(Box::new(Aborted::at(progress, Stage::ParseTag, started, e, None))),
        }
    }

    fn validate_stage(&self, progress: Progress, version: &Version) -> StageResult<Progress> {
        let started = Instant::now();
        let manifest_version = match read_manifest_version(&self.manifest_path) {
            Ok(v) => v,
            Err(e) => {
                return Err(Box::new(Aborted::at(
                    progress,
                    Stage::ValidateVersion,
                    started,
                    e,
                    None,
                )))
            }
        };
        let mut progress = progress;
        progress.manifest_version = Some(manifest_version.clone());

        match consistency::validate(version, &manifest_version) {
            Ok(()) => Ok(progress.record(
                Stage::ValidateVersion,
                true,
                format!("tag and manifest agree on {manifest_version}"),
                started,
            )),
            Err(e) => Err(Box::new(Aborted::at(
                progress,
                Stage::ValidateVersion,
                started,
                e,
                None,
            ))),
        }
    }

    async fn jobs_stage(
        &self,
        progress: Progress,
        version: &Version,
    ) -> StageResult<(Progress, Option<Artifact>, GateVerdict)> {
        let started = Instant::now();
        if !self.graph.contains(&self.build_job) {
            let error = ReleaseError::InvalidGraph {
                reason: format!("build job '{}' is not part of the graph", self.build_job),
            };
            return Err(Box::new(Aborted::at(progress, Stage::Jobs, started, error, None)));
        }
        // Without variants nothing would confirm the upload installs.
        if self.variants.is_empty() {
            let error = ReleaseError::InvalidGraph {
                reason: "no install variants declared for verification".to_string(),
            };
            return Err(Box::new(Aborted::at(progress, Stage::Jobs, started, error, None)));
        }

        let build = BuildJob::new(Arc::clone(&self.builder), *version);
        let slot = build.slot();
        let mut executors = self.executors.clone();
        executors.insert(self.build_job.clone(), Arc::new(build));

        let graph_run = match Scheduler::new(self.scheduler.clone())
            .run(&self.graph, &executors)
            .await
        {
            Ok(run) => run,
            Err(e) => return Err(Box::new(Aborted::at(progress, Stage::Jobs, started, e, None))),
        };

        let artifact = slot.lock().await.take();
        let verdict = graph_run.verdict();
        let mut progress = progress;
        progress.jobs = graph_run.reports().cloned().collect();
        progress.artifact = artifact.as_ref().map(Artifact::info);

        if verdict.passed && artifact.is_none() {
            let error = ReleaseError::MissingArtifact {
                job: self.build_job.clone(),
            };
            return Err(Box::new(Aborted::at(progress, Stage::Jobs, started, error, None)));
        }

        let diagnostic = if verdict.passed {
            verdict.message.clone()
        } else {
            graph_run
                .failures()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };
        let progress = progress.record(Stage::Jobs, verdict.passed, diagnostic, started);
        Ok((progress, artifact, verdict))
    }

    async fn publish_stage(
        &self,
        progress: Progress,
        artifact: Option<Artifact>,
        verdict: &GateVerdict,
    ) -> StageResult<(Progress, Artifact)> {
        let started = Instant::now();
        let Some(artifact) = artifact else {
            // Nothing was built; a red graph is still reported as a denial.
            let error = ReleaseError::PublishDenied {
                blocking: verdict.blocking.clone(),
            };
            return Err(Box::new(Aborted::at(progress, Stage::Publish, started, error, None)));
        };

        let publisher = Publisher::new(self.package.clone(), Arc::clone(&self.index));
        match publisher.publish(&artifact, verdict).await {
            Ok(receipt) => {
                let diagnostic = format!("uploaded {} to {}", receipt.file_name, receipt.index_url);
                let mut progress = progress.record(Stage::Publish, true, diagnostic, started);
                progress.receipt = Some(receipt);
                Ok((progress, artifact))
            }
            Err(e) => Err(Box::new(Aborted::at(
                progress,
                Stage::Publish,
                started,
                e,
                Some(artifact),
            ))),
        }
    }

    async fn verify_stage(
        &self,
        progress: Progress,
        version: &Version,
        artifact: Artifact,
    ) -> StageResult<Progress> {
        let started = Instant::now();
        let verifier = InstallVerifier::new(self.package.clone(), Arc::clone(&self.index))
            .with_variants(self.variants.clone())
            .with_policy(self.retry)
            .parallel(self.parallel_verify);

        let report = verifier.verify(version).await;
        let mut progress = progress;
        progress.verification = Some(report.clone());

        if report.passed() {
            let diagnostic = format!(
                "{} variant(s) verified in {} attempt(s)",
                report.variants.len(),
                report.total_attempts()
            );
            // Verified: the artifact is no longer needed.
            drop(artifact);
            return Ok(progress.record(Stage::Verify, true, diagnostic, started));
        }

        let error = report
            .first_failure()
            .unwrap_or_else(|| ReleaseError::FatalFailure {
                variant: "<none>".to_string(),
                reason: "no variant was verified".to_string(),
            });
        Err(Box::new(Aborted::at(
            progress,
            Stage::Verify,
            started,
            error,
            Some(artifact),
        )))
    }
}
