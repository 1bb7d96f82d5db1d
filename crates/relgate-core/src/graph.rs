//! Release job graph and topological planning.
//!
//! Jobs are nodes in a directed acyclic graph. An edge `A → B` means "B needs
//! A": A must succeed before B may start. The graph is assembled with a
//! [`JobGraphBuilder`] and validated once in [`JobGraphBuilder::build`];
//! a [`JobGraph`] value is always acyclic and closed over its dependency names.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ReleaseError, Result};

/// Static definition of a single job: its name and the jobs it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needs: Vec::new(),
        }
    }

    /// Add a dependency (builder style).
    pub fn needs(mut self, dependency: impl Into<String>) -> Self {
        self.needs.push(dependency.into());
        self
    }
}

/// Collects job definitions; nothing is checked until [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct JobGraphBuilder {
    jobs: Vec<JobSpec>,
}

impl JobGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(mut self, spec: JobSpec) -> Self {
        self.jobs.push(spec);
        self
    }

    pub fn add_job(&mut self, spec: JobSpec) -> &mut Self {
        self.jobs.push(spec);
        self
    }

    /// Validate and freeze the graph.
    ///
    /// Fails with [`ReleaseError::InvalidGraph`] on empty or duplicate names,
    /// dependencies on unknown jobs, self-dependencies and cycles.
    pub fn build(self) -> Result<JobGraph> {
        let invalid = |reason: String| ReleaseError::InvalidGraph { reason };

        let mut upstream: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for spec in &self.jobs {
            if spec.name.trim().is_empty() {
                return Err(invalid("job name must not be empty".to_string()));
            }
            if upstream.contains_key(&spec.name) {
                return Err(invalid(format!("duplicate job '{}'", spec.name)));
            }
            upstream.insert(spec.name.clone(), spec.needs.iter().cloned().collect());
        }

        let mut downstream: BTreeMap<String, BTreeSet<String>> = upstream
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();

        for (job, needs) in &upstream {
            for dependency in needs {
                if dependency == job {
                    return Err(invalid(format!("job '{job}' depends on itself")));
                }
                let Some(dependents) = downstream.get_mut(dependency) else {
                    return Err(invalid(format!(
                        "job '{job}' needs unknown job '{dependency}'"
                    )));
                };
                dependents.insert(job.clone());
            }
        }

        let graph = JobGraph {
            upstream,
            downstream,
        };

        let levels = graph.kahn_levels();
        let placed: usize = levels.iter().map(Vec::len).sum();
        if placed != graph.len() {
            let placed_names: BTreeSet<&String> = levels.iter().flatten().collect();
            let cyclic: Vec<&str> = graph
                .upstream
                .keys()
                .filter(|name| !placed_names.contains(name))
                .map(String::as_str)
                .collect();
            return Err(invalid(format!(
                "dependency cycle involving jobs: {}",
                cyclic.join(", ")
            )));
        }

        Ok(graph)
    }
}

/// A validated, acyclic job graph.
///
/// Adjacency is kept in both directions. `BTreeMap`/`BTreeSet` keep every
/// traversal in name order so planning output is reproducible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobGraph {
    /// `job → {jobs it needs}`
    upstream: BTreeMap<String, BTreeSet<String>>,
    /// `job → {jobs that need it}`
    downstream: BTreeMap<String, BTreeSet<String>>,
}

impl JobGraph {
    pub fn builder() -> JobGraphBuilder {
        JobGraphBuilder::new()
    }

    /// Build a graph straight from a list of specs.
    pub fn from_specs(specs: impl IntoIterator<Item = JobSpec>) -> Result<Self> {
        let mut builder = JobGraphBuilder::new();
        for spec in specs {
            builder.add_job(spec);
        }
        builder.build()
    }

    pub fn len(&self) -> usize {
        self.upstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstream.is_empty()
    }

    pub fn contains(&self, job: &str) -> bool {
        self.upstream.contains_key(job)
    }

    /// Job names in name order.
    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.upstream.keys().map(String::as_str)
    }

    /// Jobs `job` needs directly.
    pub fn dependencies_of(&self, job: &str) -> Vec<&str> {
        self.upstream
            .get(job)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Jobs that directly need `job`.
    pub fn dependents_of(&self, job: &str) -> Vec<&str> {
        self.downstream
            .get(job)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Jobs with no dependencies; they start together.
    pub fn roots(&self) -> Vec<&str> {
        self.upstream
            .iter()
            .filter(|(_, needs)| needs.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// All transitive dependents of `job` (BFS over downstream edges), sorted.
    pub fn transitive_dependents_of(&self, job: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([job.to_string()]);

        while let Some(current) = queue.pop_front() {
            for dependent in self.downstream.get(&current).into_iter().flatten() {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent.clone());
                }
            }
        }

        visited.into_iter().collect()
    }

    /// Jobs in a valid execution order (dependencies first).
    pub fn topological_order(&self) -> Vec<String> {
        self.kahn_levels().into_iter().flatten().collect()
    }

    /// Jobs grouped by Kahn wave. Every job in level `n` only needs jobs in
    /// levels `< n`, so each level can run fully in parallel.
    pub fn levels(&self) -> Vec<Vec<String>> {
        self.kahn_levels()
    }

    /// Stable SHA-256 over the sorted job/dependency listing.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (job, needs) in &self.upstream {
            hasher.update(job.as_bytes());
            hasher.update(b"\0");
            for dependency in needs {
                hasher.update(dependency.as_bytes());
                hasher.update(b"\x01");
            }
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Kahn's algorithm with level tracking. Jobs caught in a cycle never
    /// reach in-degree zero and are left out.
    fn kahn_levels(&self) -> Vec<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .upstream
            .iter()
            .map(|(name, needs)| (name.as_str(), needs.len()))
            .collect();

        let mut current: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&name, _)| name)
            .collect();

        let mut levels = Vec::new();
        while !current.is_empty() {
            let mut next = BTreeSet::new();
            for name in &current {
                for dependent in self.downstream.get(*name).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            next.insert(dependent.as_str());
                        }
                    }
                }
            }
            levels.push(current.iter().map(|s| s.to_string()).collect());
            current = next.into_iter().collect();
        }
        levels
    }
}
