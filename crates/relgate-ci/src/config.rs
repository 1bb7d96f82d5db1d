//! `relgate.toml`: package, jobs, build, index and verification settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relgate_core::{
    classify_all_transient, classify_strict, default_variants, ExecutorMap, JobExecutor,
    JobGraph, JobSpec, ReleasePipeline, RetryPolicy, SchedulerConfig, TrailingPolicy, Variant,
};
use serde::{Deserialize, Serialize};

use crate::builder::CommandBuilder;
use crate::index::CommandIndex;
use crate::job::{default_timeout_secs, expand_jobs, JobConfig, JobInstance};
use crate::runner::CommandJob;

/// Overrides `[index].url`.
pub const INDEX_URL_ENV: &str = "RELGATE_INDEX_URL";

pub const DEFAULT_CONFIG_FILE: &str = "relgate.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageConfig {
    pub name: String,
    /// Manifest holding the declared version, relative to the config file.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,
    /// Optional dependency groups; drive the default variant list.
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_manifest() -> PathBuf {
    PathBuf::from("pyproject.toml")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagConfig {
    #[serde(default)]
    pub trailing: TrailingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_job")]
    pub job: String,
    #[serde(default)]
    pub needs: Vec<String>,
    pub command: Vec<String>,
    /// Path template of the built file, e.g. `dist/{package}-{version}.tar.gz`.
    pub artifact: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_build_job() -> String {
    "build".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub url: String,
    pub publish: Vec<String>,
    pub install: Vec<String>,
    pub smoke: Vec<String>,
    #[serde(default = "default_index_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_index_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Explicit variant list; defaults to `core`, `core+<group>`, `core+all`.
    #[serde(default)]
    pub variants: Option<Vec<Variant>>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default)]
    pub parallel: bool,
    /// Treat plain install failures as fatal instead of retrying them.
    #[serde(default)]
    pub strict: bool,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_wait_secs() -> u64 {
    30
}

fn default_attempt_timeout_secs() -> u64 {
    300
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            variants: None,
            max_attempts: default_max_attempts(),
            wait_secs: default_wait_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            parallel: false,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub package: PackageConfig,
    #[serde(default)]
    pub tag: TagConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    pub build: BuildConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub verify: VerifyConfig,

    /// Directory relative paths and commands are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

impl ReleaseConfig {
    /// Parse configuration text; `root` is where relative paths point.
    pub fn from_toml_str(text: &str, root: impl Into<PathBuf>) -> Result<Self> {
        let mut config: ReleaseConfig = toml::from_str(text).context("invalid relgate config")?;
        anyhow::ensure!(
            !matches!(config.verify.variants.as_deref(), Some([])),
            "[verify] variants must list at least one install variant"
        );
        config.root = root.into();
        Ok(config)
    }

    /// Load from a file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::from_toml_str(&text, root)
            .with_context(|| format!("in {}", path.display()))?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(INDEX_URL_ENV).filter(|u| !u.is_empty()) {
            self.index.url = url;
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.package.manifest)
    }

    /// All schedulable jobs, matrix-expanded, build job last.
    pub fn job_instances(&self) -> Vec<JobInstance> {
        let mut jobs = self.jobs.clone();
        jobs.push(JobConfig {
            name: self.build.job.clone(),
            needs: self.build.needs.clone(),
            command: self.build.command.clone(),
            timeout_secs: self.build.timeout_secs,
            env: Default::default(),
            matrix: None,
        });
        expand_jobs(&jobs)
    }

    /// Validated job graph. Fails with `InvalidGraph` on cycles, unknown
    /// dependencies, or duplicate names.
    pub fn job_graph(&self) -> relgate_core::Result<JobGraph> {
        JobGraph::from_specs(self.job_instances().into_iter().map(|instance| JobSpec {
            name: instance.name,
            needs: instance.needs,
        }))
    }

    /// Command executors for every job except the build job.
    pub fn executors(&self) -> ExecutorMap {
        self.job_instances()
            .iter()
            .filter(|instance| instance.name != self.build.job)
            .map(|instance| {
                let job: Arc<dyn JobExecutor> =
                    Arc::new(CommandJob::from_instance(instance, Some(self.root.clone())));
                (instance.name.clone(), job)
            })
            .collect()
    }

    pub fn builder(&self) -> CommandBuilder {
        CommandBuilder {
            package: self.package.name.clone(),
            command: self.build.command.clone(),
            artifact: self.build.artifact.clone(),
            root: self.root.clone(),
            timeout: Duration::from_secs(self.build.timeout_secs),
        }
    }

    pub fn index(&self) -> CommandIndex {
        CommandIndex {
            url: self.index.url.clone(),
            publish: self.index.publish.clone(),
            install: self.index.install.clone(),
            smoke: self.index.smoke.clone(),
            root: self.root.clone(),
            timeout: Duration::from_secs(self.index.timeout_secs),
        }
    }

    pub fn variants(&self) -> Vec<Variant> {
        self.verify
            .variants
            .clone()
            .unwrap_or_else(|| default_variants(&self.package.groups))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.verify.max_attempts,
            wait: Duration::from_secs(self.verify.wait_secs),
            attempt_timeout: Duration::from_secs(self.verify.attempt_timeout_secs),
            classify: if self.verify.strict {
                classify_strict
            } else {
                classify_all_transient
            },
        }
    }

    /// Wire the command-backed collaborators into a pipeline.
    pub fn pipeline(&self) -> Result<ReleasePipeline> {
        let graph = self.job_graph().context("invalid job graph")?;
        Ok(ReleasePipeline::new(
            self.package.name.clone(),
            self.manifest_path(),
            graph,
            Arc::new(self.builder()),
            Arc::new(self.index()),
        )
        .with_executors(self.executors())
        .with_build_job(self.build.job.clone())
        .with_trailing_policy(self.tag.trailing)
        .with_scheduler(self.scheduler.clone())
        .with_variants(self.variants())
        .with_retry_policy(self.retry_policy())
        .with_parallel_verify(self.verify.parallel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relgate_core::ErrorKind;

    const SAMPLE: &str = r#"
[package]
name = "demo"
groups = ["audio", "plot"]

[tag]
trailing = "ignore"

[scheduler]
fail_fast = true

[[jobs]]
name = "lint"
command = ["ruff", "check", "."]

[[jobs]]
name = "tests"
needs = ["lint"]
command = ["pytest", "-q"]
timeout_secs = 900
matrix = { runtimes = ["3.10", "3.12"], tiers = ["lowest", "locked"] }

[build]
needs = ["tests"]
command = ["python", "-m", "build", "--sdist"]
artifact = "dist/{package}-{version}.tar.gz"

[index]
url = "https://test.pypi.org/legacy/"
publish = ["twine", "upload", "--repository-url", "{index_url}", "{artifact}"]
install = ["uv", "pip", "install", "--index-url", "{index_url}", "{spec}"]
smoke = ["python", "-c", "import demo; print(demo.__version__)"]

[verify]
max_attempts = 8
wait_secs = 45
"#;

    fn sample() -> ReleaseConfig {
        ReleaseConfig::from_toml_str(SAMPLE, "/work/demo").unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();
        assert_eq!(config.package.name, "demo");
        assert_eq!(config.package.manifest, PathBuf::from("pyproject.toml"));
        assert_eq!(config.tag.trailing, TrailingPolicy::Ignore);
        assert!(config.scheduler.fail_fast);
        assert_eq!(config.build.job, "build");
        assert_eq!(config.jobs[1].timeout_secs, 900);
        assert_eq!(config.jobs[0].timeout_secs, default_timeout_secs());
        assert_eq!(config.manifest_path(), PathBuf::from("/work/demo/pyproject.toml"));
    }

    #[test]
    fn test_graph_includes_matrix_and_build() {
        let graph = sample().job_graph().unwrap();
        assert_eq!(graph.len(), 6);
        let build_deps = graph.dependencies_of("build");
        assert_eq!(build_deps.len(), 4);
        assert!(build_deps.contains(&"tests[3.12/locked]"));
        assert_eq!(graph.levels()[0], vec!["lint".to_string()]);
    }

    #[test]
    fn test_executors_exclude_build_job() {
        let executors = sample().executors();
        assert_eq!(executors.len(), 5);
        assert!(!executors.contains_key("build"));
        assert!(executors.contains_key("tests[3.10/lowest]"));
    }

    #[test]
    fn test_unknown_need_is_invalid_graph() {
        let text = SAMPLE.replace(r#"needs = ["tests"]"#, r#"needs = ["typecheck"]"#);
        let config = ReleaseConfig::from_toml_str(&text, ".").unwrap();
        assert_eq!(config.job_graph().unwrap_err().kind(), ErrorKind::InvalidGraph);
    }

    #[test]
    fn test_env_overrides_index_url() {
        let mut config = sample();
        config.apply_env(|key| (key == INDEX_URL_ENV).then(|| "http://localhost:8080".to_string()));
        assert_eq!(config.index.url, "http://localhost:8080");

        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.index.url, "http://localhost:8080");
    }

    #[test]
    fn test_default_variants_and_policy() {
        let config = sample();
        let names: Vec<String> = config.variants().into_iter().map(|v| v.name).collect();
        assert_eq!(names, ["core", "core+audio", "core+plot", "core+all"]);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 8);
        assert_eq!(policy.wait, Duration::from_secs(45));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_explicit_variants() {
        let text = format!(
            "{SAMPLE}\n[[verify.variants]]\nname = \"core\"\n\n[[verify.variants]]\nname = \"full\"\nextras = [\"all\"]\n"
        );
        let config = ReleaseConfig::from_toml_str(&text, ".").unwrap();
        let variants = config.variants();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[1].extras, vec!["all".to_string()]);
    }

    #[test]
    fn test_empty_variant_list_rejected() {
        let text = SAMPLE.replace("wait_secs = 45", "wait_secs = 45\nvariants = []");
        let err = ReleaseConfig::from_toml_str(&text, ".").unwrap_err();
        assert!(err.to_string().contains("at least one install variant"));
    }

    #[test]
    fn test_load_resolves_root_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, SAMPLE).unwrap();

        let config = ReleaseConfig::load(&path).unwrap();
        assert_eq!(config.root, dir.path());
    }

    #[test]
    fn test_missing_section_is_error() {
        let err = ReleaseConfig::from_toml_str("[package]\nname = \"x\"\n", ".").unwrap_err();
        assert!(format!("{err:#}").contains("invalid relgate config"));
    }
}
