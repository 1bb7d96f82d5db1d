//! Concurrent execution of a [`JobGraph`].
//!
//! Every job whose dependencies have all succeeded is spawned on its own tokio
//! task, so independent jobs run in parallel. When a job fails, all of its
//! transitive dependents are marked failed without their executors ever being
//! called.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::{ReleaseError, Result};
use crate::graph::JobGraph;
use crate::metrics::METRICS;
use crate::obs;

/// What an executor reports when it finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure { reason: String },
}

impl JobOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        JobOutcome::Failure {
            reason: reason.into(),
        }
    }
}

/// External collaborator wrapped by a job (test runner, linter, builder...).
///
/// The environment (runtime version, dependency tier) is prepared by whoever
/// constructs the executor; `run` takes no arguments.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self) -> JobOutcome;
}

/// Executors keyed by job name.
pub type ExecutorMap = BTreeMap<String, Arc<dyn JobExecutor>>;

/// Why a job ended in `Failure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    /// The executor ran and reported failure (or panicked).
    Executed { reason: String },
    /// Not run: a transitive dependency failed.
    UpstreamFailed { upstream: String },
    /// Not run: fail-fast tripped before the job could start.
    Cancelled,
}

impl FailureCause {
    pub fn describe(&self) -> String {
        match self {
            FailureCause::Executed { reason } => reason.clone(),
            FailureCause::UpstreamFailed { upstream } => {
                format!("skipped: upstream job '{upstream}' failed")
            }
            FailureCause::Cancelled => "cancelled after an earlier failure".to_string(),
        }
    }
}

/// Per-job lifecycle. `Pending` moves to a terminal state exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Success,
    Failure(FailureCause),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending)
    }
}

/// Final record for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub name: String,
    pub state: JobState,
    /// Wall time of the executor; `None` when it never ran.
    pub duration_ms: Option<u64>,
}

impl JobReport {
    pub fn executed(&self) -> bool {
        self.duration_ms.is_some()
    }
}

/// The publish gate decision derived from a finished graph run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Every job succeeded.
    pub passed: bool,
    /// Jobs whose own executor failed (root causes), in name order.
    pub blocking: Vec<String>,
    pub message: String,
}

impl GateVerdict {
    pub fn green() -> Self {
        Self {
            passed: true,
            blocking: Vec::new(),
            message: "all jobs succeeded".to_string(),
        }
    }
}

/// Outcome of executing a whole graph. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphRun {
    jobs: BTreeMap<String, JobReport>,
}

impl GraphRun {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.get(name)
    }

    pub fn state(&self, name: &str) -> Option<&JobState> {
        self.jobs.get(name).map(|report| &report.state)
    }

    /// Reports in name order.
    pub fn reports(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.values()
    }

    pub fn all_green(&self) -> bool {
        self.jobs
            .values()
            .all(|report| report.state == JobState::Success)
    }

    /// Gate verdict. Depends only on job states, never on timing.
    pub fn verdict(&self) -> GateVerdict {
        if self.all_green() {
            return GateVerdict::green();
        }
        let blocking: Vec<String> = self
            .jobs
            .values()
            .filter(|r| matches!(r.state, JobState::Failure(FailureCause::Executed { .. })))
            .map(|r| r.name.clone())
            .collect();
        let failed = self
            .jobs
            .values()
            .filter(|r| matches!(r.state, JobState::Failure(_)))
            .count();
        GateVerdict {
            message: format!(
                "{failed} of {} job(s) failed; root cause(s): {}",
                self.jobs.len(),
                blocking.join(", ")
            ),
            passed: false,
            blocking,
        }
    }

    /// One `JobFailure` per failed job, in name order.
    pub fn failures(&self) -> Vec<ReleaseError> {
        self.jobs
            .values()
            .filter_map(|report| match &report.state {
                JobState::Failure(cause) => Some(ReleaseError::JobFailure {
                    name: report.name.clone(),
                    reason: cause.describe(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Scheduler knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Stop starting new jobs after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
}

/// Runs a validated job graph against a set of executors.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Check that executors and graph name exactly the same jobs.
    pub fn check_executors(graph: &JobGraph, executors: &ExecutorMap) -> Result<()> {
        if let Some(missing) = graph.job_names().find(|name| !executors.contains_key(*name)) {
            return Err(ReleaseError::InvalidGraph {
                reason: format!("no executor registered for job '{missing}'"),
            });
        }
        if let Some(extra) = executors.keys().find(|name| !graph.contains(name)) {
            return Err(ReleaseError::InvalidGraph {
                reason: format!("executor registered for unknown job '{extra}'"),
            });
        }
        Ok(())
    }

    /// Execute every job in dependency order, as concurrently as the edges allow.
    ///
    /// Returns `InvalidGraph` before running anything if the executor set does
    /// not match the graph. Job failures are not errors here: they are
    /// recorded in the returned [`GraphRun`].
    pub async fn run(&self, graph: &JobGraph, executors: &ExecutorMap) -> Result<GraphRun> {
        Self::check_executors(graph, executors)?;

        let mut states: BTreeMap<String, JobState> = graph
            .job_names()
            .map(|name| (name.to_string(), JobState::Pending))
            .collect();
        let mut durations: BTreeMap<String, u64> = BTreeMap::new();
        let mut waiting_on: BTreeMap<String, usize> = graph
            .job_names()
            .map(|name| (name.to_string(), graph.dependencies_of(name).len()))
            .collect();

        let mut in_flight = JoinSet::new();
        let mut tripped = false;

        for root in graph.roots() {
            spawn_job(&mut in_flight, root, executors);
        }

        while let Some(joined) = in_flight.join_next().await {
            let (name, outcome, elapsed_ms) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // The wrapper task never panics; a join error here means
                    // the runtime is shutting down. Leftovers are swept below.
                    error!(error = %e, "job wrapper task aborted");
                    continue;
                }
            };

            durations.insert(name.clone(), elapsed_ms);
            obs::emit_job_finished(&name, outcome == JobOutcome::Success, elapsed_ms);

            match outcome {
                JobOutcome::Success => {
                    states.insert(name.clone(), JobState::Success);
                    for dependent in graph.dependents_of(&name) {
                        let Some(remaining) = waiting_on.get_mut(dependent) else {
                            continue;
                        };
                        *remaining -= 1;
                        if *remaining > 0 || states.get(dependent) != Some(&JobState::Pending) {
                            continue;
                        }
                        if tripped {
                            cancel(&mut states, dependent);
                        } else {
                            spawn_job(&mut in_flight, dependent, executors);
                        }
                    }
                }
                JobOutcome::Failure { reason } => {
                    states.insert(
                        name.clone(),
                        JobState::Failure(FailureCause::Executed { reason }),
                    );
                    for dependent in graph.transitive_dependents_of(&name) {
                        if states.get(&dependent) == Some(&JobState::Pending) {
                            obs::emit_job_short_circuited(&dependent, &name);
                            METRICS.inc_jobs_short_circuited();
                            states.insert(
                                dependent,
                                JobState::Failure(FailureCause::UpstreamFailed {
                                    upstream: name.clone(),
                                }),
                            );
                        }
                    }
                    if self.config.fail_fast && !tripped {
                        debug!(job = %name, "fail-fast tripped; no further jobs will start");
                        tripped = true;
                    }
                }
            }
        }

        // Anything still pending never got to start (fail-fast or aborted wrapper).
        let leftovers: Vec<String> = states
            .iter()
            .filter(|(_, state)| !state.is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        for name in leftovers {
            cancel(&mut states, &name);
        }

        let jobs = states
            .into_iter()
            .map(|(name, state)| {
                let duration_ms = durations.get(&name).copied();
                (
                    name.clone(),
                    JobReport {
                        name,
                        state,
                        duration_ms,
                    },
                )
            })
            .collect();

        Ok(GraphRun { jobs })
    }
}

fn cancel(states: &mut BTreeMap<String, JobState>, job: &str) {
    METRICS.inc_jobs_short_circuited();
    states.insert(job.to_string(), JobState::Failure(FailureCause::Cancelled));
}

/// Spawn `job` on its own task. The executor runs in a nested task so a panic
/// is reported as a failure of that job instead of tearing down the run.
fn spawn_job(
    in_flight: &mut JoinSet<(String, JobOutcome, u64)>,
    job: &str,
    executors: &ExecutorMap,
) {
    let Some(executor) = executors.get(job).map(Arc::clone) else {
        return;
    };
    let name = job.to_string();

    obs::emit_job_started(&name);
    METRICS.inc_jobs_executed();

    in_flight.spawn(async move {
        let started = Instant::now();
        let outcome = match tokio::spawn(async move { executor.run().await }).await {
            Ok(outcome) => outcome,
            Err(e) => JobOutcome::failure(format!("executor panicked: {e}")),
        };
        (name, outcome, started.elapsed().as_millis() as u64)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::JobSpec;

    struct Fixed(JobOutcome);

    #[async_trait]
    impl JobExecutor for Fixed {
        async fn run(&self) -> JobOutcome {
            self.0.clone()
        }
    }

    struct Panics;

    #[async_trait]
    impl JobExecutor for Panics {
        async fn run(&self) -> JobOutcome {
            panic!("boom")
        }
    }

    fn ok() -> Arc<dyn JobExecutor> {
        Arc::new(Fixed(JobOutcome::Success))
    }

    fn fail() -> Arc<dyn JobExecutor> {
        Arc::new(Fixed(JobOutcome::failure("exit code 1")))
    }

    fn chain() -> JobGraph {
        JobGraph::builder()
            .job(JobSpec::new("lint"))
            .job(JobSpec::new("build").needs("lint"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_executor_rejected() {
        let mut executors = ExecutorMap::new();
        executors.insert("lint".to_string(), ok());
        let err = Scheduler::default().run(&chain(), &executors).await.unwrap_err();
        assert!(err.to_string().contains("no executor registered for job 'build'"));
    }

    #[tokio::test]
    async fn test_extra_executor_rejected() {
        let mut executors = ExecutorMap::new();
        executors.insert("lint".to_string(), ok());
        executors.insert("build".to_string(), ok());
        executors.insert("docs".to_string(), ok());
        let err = Scheduler::default().run(&chain(), &executors).await.unwrap_err();
        assert!(matches!(err, ReleaseError::InvalidGraph { .. }));
    }

    #[tokio::test]
    async fn test_panicking_executor_is_job_failure() {
        let mut executors = ExecutorMap::new();
        executors.insert("lint".to_string(), Arc::new(Panics) as Arc<dyn JobExecutor>);
        executors.insert("build".to_string(), ok());
        let run = Scheduler::default().run(&chain(), &executors).await.unwrap();

        match run.state("lint") {
            Some(JobState::Failure(FailureCause::Executed { reason })) => {
                assert!(reason.contains("panicked"))
            }
            other => panic!("unexpected lint state {other:?}"),
        }
        assert_eq!(
            run.state("build"),
            Some(&JobState::Failure(FailureCause::UpstreamFailed {
                upstream: "lint".to_string()
            }))
        );
        assert!(!run.job("build").unwrap().executed());
    }

    #[tokio::test]
    async fn test_verdict_lists_root_causes_only() {
        let mut executors = ExecutorMap::new();
        executors.insert("lint".to_string(), fail());
        executors.insert("build".to_string(), ok());
        let run = Scheduler::default().run(&chain(), &executors).await.unwrap();

        let verdict = run.verdict();
        assert!(!verdict.passed);
        assert_eq!(verdict.blocking, vec!["lint"]);
        assert_eq!(run.failures().len(), 2);
    }

    #[tokio::test]
    async fn test_all_green() {
        let mut executors = ExecutorMap::new();
        executors.insert("lint".to_string(), ok());
        executors.insert("build".to_string(), ok());
        let run = Scheduler::default().run(&chain(), &executors).await.unwrap();
        assert!(run.all_green());
        assert_eq!(run.verdict(), GateVerdict::green());
        assert!(run.reports().all(JobReport::executed));
    }

    #[test]
    fn test_job_state_serde_shape() {
        let state = JobState::Failure(FailureCause::UpstreamFailed {
            upstream: "lint".to_string(),
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failure");
    }
}
