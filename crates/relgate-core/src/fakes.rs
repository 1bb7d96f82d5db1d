//! In-memory fakes for the pipeline seams (testing only)
//!
//! Provides `MemoryIndex`, `ScriptedJob`, and `StaticBuilder`, which satisfy
//! the trait contracts without touching the network or spawning processes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::artifact::{Artifact, ArtifactBuilder, BuildError};
use crate::index::{IndexError, InstallError, InstallRequest, InstalledPackage, PackageIndex};
use crate::scheduler::{JobExecutor, JobOutcome};
use crate::version::Version;

type InstallScript = VecDeque<Result<InstalledPackage, InstallError>>;

// ---------------------------------------------------------------------------
// MemoryIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct IndexState {
    /// package -> published version strings
    published: BTreeMap<String, BTreeSet<String>>,
    uploads: usize,
    /// variant name -> install calls so far
    installs: BTreeMap<String, u32>,
    scripts: HashMap<String, InstallScript>,
}

/// In-memory package index.
///
/// Rejects duplicate versions like a real index, and can simulate
/// propagation lag, slow installs, and a wrong artifact being served.
#[derive(Debug)]
pub struct MemoryIndex {
    url: String,
    state: Mutex<IndexState>,
    fail_uploads: bool,
    install_latency: Duration,
    propagation_delay: u32,
    reported_version: Option<String>,
}

impl MemoryIndex {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(IndexState::default()),
            fail_uploads: false,
            install_latency: Duration::ZERO,
            propagation_delay: 0,
            reported_version: None,
        }
    }

    /// Every upload fails with a transport error.
    pub fn failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    /// Each install call sleeps this long (on the tokio clock) before answering.
    pub fn with_install_latency(mut self, latency: Duration) -> Self {
        self.install_latency = latency;
        self
    }

    /// The first `attempts` installs of each variant see `NotYetAvailable`
    /// even after upload.
    pub fn with_propagation_delay(mut self, attempts: u32) -> Self {
        self.propagation_delay = attempts;
        self
    }

    /// Installed packages claim to be `version` regardless of what was asked.
    pub fn reporting_version(mut self, version: impl Into<String>) -> Self {
        self.reported_version = Some(version.into());
        self
    }

    /// Pretend `version` of `package` was uploaded earlier.
    pub fn mark_published(&self, package: &str, version: &Version) {
        let mut state = self.state.lock().unwrap();
        state
            .published
            .entry(package.to_string())
            .or_default()
            .insert(version.to_string());
    }

    /// Queue explicit results for a variant; consumed before default behaviour.
    pub fn script_install(
        &self,
        variant: &str,
        results: Vec<Result<InstalledPackage, InstallError>>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .scripts
            .entry(variant.to_string())
            .or_default()
            .extend(results);
    }

    pub fn upload_calls(&self) -> usize {
        self.state.lock().unwrap().uploads
    }

    pub fn install_calls(&self) -> u32 {
        self.state.lock().unwrap().installs.values().sum()
    }

    pub fn install_calls_for(&self, variant: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .installs
            .get(variant)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_published(&self, package: &str, version: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .published
            .get(package)
            .is_some_and(|versions| versions.contains(version))
    }
}

#[async_trait]
impl PackageIndex for MemoryIndex {
    fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, package: &str, artifact: &Artifact) -> Result<(), IndexError> {
        let mut state = self.state.lock().unwrap();
        state.uploads += 1;
        if self.fail_uploads {
            return Err(IndexError::Transport("connection reset by peer".to_string()));
        }
        let version = artifact.version.to_string();
        let versions = state.published.entry(package.to_string()).or_default();
        if !versions.insert(version.clone()) {
            return Err(IndexError::AlreadyExists {
                package: package.to_string(),
                version,
            });
        }
        Ok(())
    }

    async fn install(&self, request: &InstallRequest) -> Result<InstalledPackage, InstallError> {
        if !self.install_latency.is_zero() {
            tokio::time::sleep(self.install_latency).await;
        }

        let mut state = self.state.lock().unwrap();
        let calls = {
            let n = state.installs.entry(request.variant.name.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(result) = state
            .scripts
            .get_mut(&request.variant.name)
            .and_then(VecDeque::pop_front)
        {
            return result;
        }

        let version = request.version.to_string();
        let published = state
            .published
            .get(&request.package)
            .is_some_and(|versions| versions.contains(&version));
        if !published || calls <= self.propagation_delay {
            return Err(InstallError::NotYetAvailable(request.requirement()));
        }

        Ok(InstalledPackage {
            reported_version: self.reported_version.clone().unwrap_or(version),
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedJob
// ---------------------------------------------------------------------------

/// Job executor with a fixed outcome that counts its invocations.
#[derive(Debug)]
pub struct ScriptedJob {
    outcome: JobOutcome,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedJob {
    pub fn succeeding() -> Self {
        Self::with_outcome(JobOutcome::Success)
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self::with_outcome(JobOutcome::failure(reason))
    }

    pub fn with_outcome(outcome: JobOutcome) -> Self {
        Self {
            outcome,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for ScriptedJob {
    async fn run(&self) -> JobOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}

// ---------------------------------------------------------------------------
// StaticBuilder
// ---------------------------------------------------------------------------

/// Builder that packages a fixed payload as `<package>-<version>.tar.gz`.
#[derive(Debug)]
pub struct StaticBuilder {
    package: String,
    payload: Vec<u8>,
    error: Option<String>,
    calls: AtomicUsize,
}

impl StaticBuilder {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            payload: b"static payload".to_vec(),
            error: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactBuilder for StaticBuilder {
    async fn build(&self, version: &Version) -> Result<Artifact, BuildError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.error {
            return Err(BuildError(error.clone()));
        }
        Ok(Artifact::new(
            format!("{}-{version}.tar.gz", self.package),
            *version,
            self.payload.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Variant;

    fn request(version: &Version) -> InstallRequest {
        InstallRequest {
            package: "demo".into(),
            variant: Variant::core(),
            version: *version,
        }
    }

    #[tokio::test]
    async fn test_memory_index_rejects_duplicates() {
        let index = MemoryIndex::new("mem://staging");
        let artifact = Artifact::new("demo-1.0.0.tar.gz", Version::final_release(1, 0, 0), vec![]);

        index.publish("demo", &artifact).await.unwrap();
        let err = index.publish("demo", &artifact).await.unwrap_err();
        assert!(matches!(err, IndexError::AlreadyExists { .. }));
        assert!(index.is_published("demo", "1.0.0"));
    }

    #[tokio::test]
    async fn test_memory_index_propagation_delay() {
        let index = MemoryIndex::new("mem://staging").with_propagation_delay(2);
        let version = Version::final_release(1, 0, 0);
        index.mark_published("demo", &version);

        for _ in 0..2 {
            assert!(matches!(
                index.install(&request(&version)).await,
                Err(InstallError::NotYetAvailable(_))
            ));
        }
        let installed = index.install(&request(&version)).await.unwrap();
        assert_eq!(installed.reported_version, "1.0.0");
        assert_eq!(index.install_calls_for("core"), 3);
    }

    #[tokio::test]
    async fn test_scripted_job_counts_calls() {
        let job = ScriptedJob::failing("red");
        assert_eq!(job.run().await, JobOutcome::failure("red"));
        assert_eq!(job.calls(), 1);
    }
}
