//! Job definitions from `relgate.toml` and matrix expansion.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Exported to matrix jobs: the runtime version under test.
pub const RUNTIME_ENV: &str = "RELGATE_RUNTIME";
/// Exported to matrix jobs: the dependency tier (e.g. `lowest`, `locked`).
pub const DEPENDENCY_TIER_ENV: &str = "RELGATE_DEPENDENCY_TIER";

pub(crate) fn default_timeout_secs() -> u64 {
    1800
}

/// Runtimes × dependency tiers. An empty tier list expands over runtimes only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub runtimes: Vec<String>,
    #[serde(default)]
    pub tiers: Vec<String>,
}

/// One `[[jobs]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    #[serde(default)]
    pub needs: Vec<String>,

    /// Command to execute (first element is the executable).
    pub command: Vec<String>,

    /// Timeout in seconds; 0 disables it.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
}

impl JobConfig {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            needs: Vec::new(),
            command,
            timeout_secs: default_timeout_secs(),
            env: BTreeMap::new(),
            matrix: None,
        }
    }

    /// Instances of this job, before dependency names are rewritten.
    ///
    /// Without a matrix this is the job itself. With one, each instance is
    /// named `<job>[<runtime>]` or `<job>[<runtime>/<tier>]` and carries the
    /// matrix values in its environment.
    pub fn instances(&self) -> Vec<JobInstance> {
        let Some(matrix) = self.matrix.as_ref().filter(|m| !m.runtimes.is_empty()) else {
            return vec![self.instance(self.name.clone(), BTreeMap::new())];
        };

        let mut instances = Vec::new();
        for runtime in &matrix.runtimes {
            let mut vars = BTreeMap::from([(RUNTIME_ENV.to_string(), runtime.clone())]);
            if matrix.tiers.is_empty() {
                instances.push(self.instance(format!("{}[{runtime}]", self.name), vars));
                continue;
            }
            for tier in &matrix.tiers {
                vars.insert(DEPENDENCY_TIER_ENV.to_string(), tier.clone());
                instances.push(
                    self.instance(format!("{}[{runtime}/{tier}]", self.name), vars.clone()),
                );
            }
        }
        instances
    }

    fn instance(&self, name: String, matrix_env: BTreeMap<String, String>) -> JobInstance {
        let mut env = self.env.clone();
        env.extend(matrix_env);
        JobInstance {
            name,
            base: self.name.clone(),
            needs: self.needs.clone(),
            command: self.command.clone(),
            timeout_secs: self.timeout_secs,
            env,
        }
    }
}

/// A concrete schedulable job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub name: String,
    /// The `[[jobs]]` entry this came from.
    pub base: String,
    pub needs: Vec<String>,
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub env: BTreeMap<String, String>,
}

/// Expand every job and point dependencies on a matrix job at all of its
/// instances. Unknown dependency names are left alone for graph validation
/// to reject.
pub fn expand_jobs(jobs: &[JobConfig]) -> Vec<JobInstance> {
    let instances: Vec<Vec<JobInstance>> = jobs.iter().map(JobConfig::instances).collect();

    let by_base: BTreeMap<&str, Vec<String>> = jobs
        .iter()
        .zip(&instances)
        .map(|(job, expanded)| {
            (
                job.name.as_str(),
                expanded.iter().map(|i| i.name.clone()).collect(),
            )
        })
        .collect();

    instances
        .into_iter()
        .flatten()
        .map(|mut instance| {
            instance.needs = instance
                .needs
                .iter()
                .flat_map(|need| {
                    by_base
                        .get(need.as_str())
                        .cloned()
                        .unwrap_or_else(|| vec![need.clone()])
                })
                .collect();
            instance
        })
        .collect()
}
