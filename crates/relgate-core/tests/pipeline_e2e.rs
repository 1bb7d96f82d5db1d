//! End-to-end pipeline runs against in-memory collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relgate_core::fakes::{MemoryIndex, ScriptedJob, StaticBuilder};
use relgate_core::{
    classify_all_transient, default_variants, ErrorKind, JobGraph, JobSpec, PipelineOutcome,
    ReleasePipeline, RetryPolicy, Stage,
};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    manifest: PathBuf,
    index: Arc<MemoryIndex>,
    builder: Arc<StaticBuilder>,
    lint: Arc<ScriptedJob>,
    tests: Arc<ScriptedJob>,
}

impl Fixture {
    fn new(manifest_version: &str) -> Self {
        Self::with(manifest_version, MemoryIndex::new("mem://staging"), ScriptedJob::succeeding())
    }

    fn with(manifest_version: &str, index: MemoryIndex, lint: ScriptedJob) -> Self {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("pyproject.toml");
        std::fs::write(
            &manifest,
            format!("[project]\nname = \"demo\"\nversion = \"{manifest_version}\"\n"),
        )
        .unwrap();
        Self {
            _dir: dir,
            manifest,
            index: Arc::new(index),
            builder: Arc::new(StaticBuilder::new("demo")),
            lint: Arc::new(lint),
            tests: Arc::new(ScriptedJob::succeeding()),
        }
    }

    /// lint → build, tests (independent of build)
    fn pipeline(&self) -> ReleasePipeline {
        let graph = JobGraph::builder()
            .job(JobSpec::new("lint"))
            .job(JobSpec::new("tests"))
            .job(JobSpec::new("build").needs("lint"))
            .build()
            .unwrap();
        ReleasePipeline::new(
            "demo",
            &self.manifest,
            graph,
            self.builder.clone(),
            self.index.clone(),
        )
        .with_executor("lint", self.lint.clone())
        .with_executor("tests", self.tests.clone())
        .with_variants(default_variants(&["audio".into(), "plot".into()]))
        .with_retry_policy(RetryPolicy {
            max_attempts: 4,
            wait: Duration::from_secs(20),
            attempt_timeout: Duration::from_secs(120),
            classify: classify_all_transient,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn green_run_publishes_and_verifies() {
    let fx = Fixture::with(
        "2.0.0",
        MemoryIndex::new("mem://staging").with_propagation_delay(2),
        ScriptedJob::succeeding(),
    );

    let run = fx.pipeline().run("v2.0.0").await;

    assert!(run.succeeded(), "{:?}", run.error);
    assert_eq!(run.report.outcome.to_string(), "Published&Verified");
    assert!(run.retained_artifact.is_none());
    assert_eq!(fx.builder.calls(), 1);
    assert_eq!(fx.index.upload_calls(), 1);
    assert!(fx.index.is_published("demo", "2.0.0"));

    let receipt = run.report.receipt.as_ref().unwrap();
    assert_eq!(receipt.file_name, "demo-2.0.0.tar.gz");
    assert_eq!(receipt.index_url, "mem://staging");

    let verification = run.report.verification.as_ref().unwrap();
    assert_eq!(verification.variants.len(), 4);
    // two propagation misses then success, for every variant
    assert!(verification.variants.iter().all(|v| v.attempts.len() == 3));

    let stages: Vec<Stage> = run.report.stages.iter().map(|s| s.stage).collect();
    assert_eq!(
        stages,
        [
            Stage::ParseTag,
            Stage::ValidateVersion,
            Stage::Jobs,
            Stage::Publish,
            Stage::Verify
        ]
    );
    assert!(run.report.stages.iter().all(|s| s.passed));
    assert_eq!(run.report.graph_digest.len(), 64);
}

#[tokio::test]
async fn manifest_mismatch_aborts_before_side_effects() {
    let fx = Fixture::new("1.9.9");

    let run = fx.pipeline().run("v2.0.0").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: VersionMismatch");
    assert_eq!(fx.lint.calls(), 0);
    assert_eq!(fx.builder.calls(), 0);
    assert_eq!(fx.index.upload_calls(), 0);
    assert!(run.report.jobs.is_empty());
    assert!(run.retained_artifact.is_none());

    let validate = run.report.stage(Stage::ValidateVersion).unwrap();
    assert!(!validate.passed);
    assert!(validate.diagnostic.contains("2.0.0"));
    assert!(validate.diagnostic.contains("1.9.9"));
    assert_eq!(run.report.manifest_version.as_deref(), Some("1.9.9"));
}

#[tokio::test]
async fn malformed_tag_aborts_at_parse() {
    let fx = Fixture::new("2.0.0");

    let run = fx.pipeline().run("2.0.0").await;

    assert_eq!(
        run.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::MalformedTag)
    );
    assert_eq!(run.report.stages.len(), 1);
    assert!(run.report.version.is_none());
    assert_eq!(fx.builder.calls(), 0);
}

#[tokio::test]
async fn dev_tag_requires_exact_manifest_spelling() {
    let fx = Fixture::new("1.2.3");

    let run = fx.pipeline().run("v1.2.3-dev1").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: VersionMismatch");
}

#[tokio::test]
async fn failed_job_denies_publish() {
    let fx = Fixture::with(
        "2.0.0",
        MemoryIndex::new("mem://staging"),
        ScriptedJob::failing("ruff found 3 errors"),
    );

    let run = fx.pipeline().run("v2.0.0").await;

    match &run.report.outcome {
        PipelineOutcome::Aborted { kind, diagnostic } => {
            assert_eq!(*kind, ErrorKind::PublishDenied);
            assert!(diagnostic.contains("lint"));
        }
        other => panic!("expected abort, got {other}"),
    }
    // build depends on lint and was short-circuited
    assert_eq!(fx.builder.calls(), 0);
    assert_eq!(fx.index.upload_calls(), 0);
    assert_eq!(fx.index.install_calls(), 0);

    let jobs = run.report.stage(Stage::Jobs).unwrap();
    assert!(!jobs.passed);
    assert!(jobs.diagnostic.contains("job 'lint' failed"));
    assert!(jobs.diagnostic.contains("job 'build' failed"));
}

#[tokio::test]
async fn artifact_retained_when_unrelated_job_fails() {
    let fx = Fixture::new("2.0.0");
    let pipeline = fx
        .pipeline()
        .with_executor("tests", Arc::new(ScriptedJob::failing("2 tests failed")));

    let run = pipeline.run("v2.0.0").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: PublishDenied");
    assert_eq!(fx.builder.calls(), 1);
    assert_eq!(fx.index.upload_calls(), 0);
    let artifact = run.retained_artifact.unwrap();
    assert_eq!(artifact.file_name, "demo-2.0.0.tar.gz");
    assert_eq!(run.report.artifact.unwrap().digest, artifact.digest);
}

#[tokio::test]
async fn upload_failure_skips_verification() {
    let fx = Fixture::with(
        "2.0.0",
        MemoryIndex::new("mem://staging").failing_uploads(),
        ScriptedJob::succeeding(),
    );

    let run = fx.pipeline().run("v2.0.0").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: UploadFailed");
    assert_eq!(fx.index.upload_calls(), 1);
    assert_eq!(fx.index.install_calls(), 0);
    assert!(run.report.verification.is_none());
    assert!(run.retained_artifact.is_some());
}

#[tokio::test(start_paused = true)]
async fn wrong_installed_version_is_fatal() {
    let fx = Fixture::with(
        "2.0.0",
        MemoryIndex::new("mem://staging").reporting_version("1.9.9"),
        ScriptedJob::succeeding(),
    );

    let run = fx.pipeline().run("v2.0.0").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: FatalFailure");
    // first variant fails fatally on its only attempt
    let verification = run.report.verification.as_ref().unwrap();
    assert_eq!(verification.variants[0].attempts.len(), 1);
    assert!(run.retained_artifact.is_some());
}

#[tokio::test]
async fn build_job_must_be_in_graph() {
    let fx = Fixture::new("2.0.0");
    let pipeline = fx.pipeline().with_build_job("package");

    let run = pipeline.run("v2.0.0").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: InvalidGraph");
    assert_eq!(fx.lint.calls(), 0);
}

#[tokio::test]
async fn empty_variant_list_aborts_before_upload() {
    let fx = Fixture::new("2.0.0");
    let pipeline = fx.pipeline().with_variants(Vec::new());

    let run = pipeline.run("v2.0.0").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: InvalidGraph");
    assert!(run
        .report
        .stage(Stage::Jobs)
        .unwrap()
        .diagnostic
        .contains("no install variants"));
    assert_eq!(fx.lint.calls(), 0);
    assert_eq!(fx.index.upload_calls(), 0);
    assert_eq!(fx.index.install_calls(), 0);
}

#[tokio::test]
async fn build_error_is_a_job_failure() {
    let fx = Fixture::new("2.0.0");
    let graph = JobGraph::builder()
        .job(JobSpec::new("build"))
        .build()
        .unwrap();
    let pipeline = ReleasePipeline::new(
        "demo",
        &fx.manifest,
        graph,
        Arc::new(StaticBuilder::new("demo").failing("sdist backend crashed")),
        fx.index.clone(),
    );

    let run = pipeline.run("v2.0.0").await;

    assert_eq!(run.report.outcome.to_string(), "Aborted: PublishDenied");
    assert!(run
        .report
        .stage(Stage::Jobs)
        .unwrap()
        .diagnostic
        .contains("sdist backend crashed"));
}

#[tokio::test]
async fn report_serializes_to_json() {
    let fx = Fixture::new("2.0.0");

    let run = fx.pipeline().run("v2.0.0-rc1").await;
    let json = run.report.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();

    assert_eq!(value["tag"], "v2.0.0-rc1");
    assert_eq!(value["version"], "2.0.0-rc1");
    assert_eq!(value["outcome"]["status"], "aborted");
    assert_eq!(value["outcome"]["kind"], "VersionMismatch");
    assert!(value["run_id"].as_str().unwrap().len() >= 32);
}
