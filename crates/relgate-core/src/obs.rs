//! Structured observability hooks for pipeline lifecycle events.
//!
//! This module provides:
//! - A run-scoped tracing span via [`pipeline_span`]
//! - Emission functions for stage, job, publish and install-attempt events
//!
//! Events are emitted at `info!` (failures at `warn!`). Filtering follows
//! `RUST_LOG`; JSON output is selected by the binary (see
//! [`crate::telemetry::init_tracing`]).

use tracing::{info, warn};

/// Run-scoped span carrying the run id and release tag.
///
/// Attach it to the run future with `tracing::Instrument` rather than
/// entering it, since the run crosses await points.
///
/// # Example
///
/// ```ignore
/// pipeline.execute(tag).instrument(pipeline_span(&run_id, tag)).await
/// ```
pub fn pipeline_span(run_id: &str, tag: &str) -> tracing::Span {
    tracing::info_span!("relgate.pipeline", run_id = %run_id, tag = %tag)
}

pub fn emit_pipeline_started(run_id: &str, tag: &str) {
    info!(event = "pipeline.started", run_id = %run_id, tag = %tag);
}

/// Emit event: pipeline reached its terminal outcome.
pub fn emit_pipeline_finished(run_id: &str, outcome: &dyn std::fmt::Display, duration_ms: u64) {
    info!(
        event = "pipeline.finished",
        run_id = %run_id,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: a pipeline stage finished, with its diagnostic.
pub fn emit_stage_finished(stage: &str, passed: bool, diagnostic: &str) {
    if passed {
        info!(event = "stage.finished", stage = %stage, passed = passed, diagnostic = %diagnostic);
    } else {
        warn!(event = "stage.finished", stage = %stage, passed = passed, diagnostic = %diagnostic);
    }
}

pub fn emit_job_started(job: &str) {
    info!(event = "job.started", job = %job);
}

/// Emit event: a job reached a terminal state.
pub fn emit_job_finished(job: &str, succeeded: bool, duration_ms: u64) {
    info!(
        event = "job.finished",
        job = %job,
        succeeded = succeeded,
        duration_ms = duration_ms,
    );
}

/// Emit event: a job was failed without running because `upstream` failed.
pub fn emit_job_short_circuited(job: &str, upstream: &str) {
    warn!(event = "job.short_circuited", job = %job, upstream = %upstream);
}

pub fn emit_artifact_uploaded(package: &str, version: &str, digest: &str) {
    info!(event = "publish.uploaded", package = %package, version = %version, digest = %digest);
}

/// Emit event: one install attempt for a variant completed.
pub fn emit_install_attempt(variant: &str, attempt: u32, outcome: &str) {
    info!(
        event = "verify.attempt",
        variant = %variant,
        attempt = attempt,
        outcome = %outcome,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_span_create() {
        let span = pipeline_span("run-1", "v1.0.0");
        let _guard = span.enter();
        emit_stage_finished("parse_tag", true, "1.0.0");
    }
}
