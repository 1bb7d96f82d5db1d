//! Post-publish installation checks with a bounded retry budget.
//!
//! Each variant is installed from the staging index, imported, and asked for
//! its version. Index propagation makes early failures normal, so install
//! errors are classified by the [`RetryPolicy`] and transient ones retried
//! after a fixed wait.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ReleaseError;
use crate::index::{InstallError, InstallRequest, PackageIndex, Variant};
use crate::metrics::METRICS;
use crate::obs;
use crate::version::Version;

/// How an install error is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

pub type Classifier = fn(&InstallError) -> ErrorClass;

/// Every install error is worth another try; propagation lag shows up as any
/// of them depending on the index.
pub fn classify_all_transient(_: &InstallError) -> ErrorClass {
    ErrorClass::Transient
}

/// Only network-ish errors are transient; a plain install failure is fatal.
pub fn classify_strict(error: &InstallError) -> ErrorClass {
    match error {
        InstallError::Timeout { .. }
        | InstallError::ConnectionRefused(_)
        | InstallError::NotYetAvailable(_) => ErrorClass::Transient,
        InstallError::Failed(_) => ErrorClass::Fatal,
    }
}

/// Retry parameters. Plain data; the verifier owns no other retry state.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per variant, including the first. Zero behaves as one.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub wait: Duration,
    /// Upper bound on a single install attempt.
    pub attempt_timeout: Duration,
    pub classify: Classifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            wait: Duration::from_secs(15),
            attempt_timeout: Duration::from_secs(120),
            classify: classify_all_transient,
        }
    }
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    TransientFailure { reason: String },
    FatalFailure { reason: String },
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientFailure { .. } => "transient_failure",
            Self::FatalFailure { .. } => "fatal_failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationAttempt {
    pub variant: String,
    /// 1-based.
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    pub timestamp: DateTime<Utc>,
}

impl VerificationAttempt {
    pub fn error(&self) -> Option<ReleaseError> {
        match &self.outcome {
            AttemptOutcome::Success => None,
            AttemptOutcome::TransientFailure { reason } => Some(ReleaseError::TransientFailure {
                variant: self.variant.clone(),
                attempt: self.attempt_number,
                reason: reason.clone(),
            }),
            AttemptOutcome::FatalFailure { reason } => Some(ReleaseError::FatalFailure {
                variant: self.variant.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

/// The full attempt sequence for one variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantReport {
    pub variant: String,
    pub requirement: String,
    pub passed: bool,
    pub attempts: Vec<VerificationAttempt>,
    /// Terminal diagnostic when `passed` is false.
    pub error: Option<String>,
}

impl VariantReport {
    pub fn failure(&self) -> Option<ReleaseError> {
        self.error.as_ref().map(|reason| ReleaseError::FatalFailure {
            variant: self.variant.clone(),
            reason: reason.clone(),
        })
    }
}

/// Per-variant reports in declaration order. Overall success is the
/// conjunction of all of them; a report with no variants has verified
/// nothing and does not pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub variants: Vec<VariantReport>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        !self.variants.is_empty() && self.variants.iter().all(|v| v.passed)
    }

    pub fn first_failure(&self) -> Option<ReleaseError> {
        self.variants.iter().find_map(VariantReport::failure)
    }

    pub fn total_attempts(&self) -> usize {
        self.variants.iter().map(|v| v.attempts.len()).sum()
    }
}

pub struct InstallVerifier {
    package: String,
    index: Arc<dyn PackageIndex>,
    variants: Vec<Variant>,
    policy: RetryPolicy,
    parallel: bool,
}

impl InstallVerifier {
    pub fn new(package: impl Into<String>, index: Arc<dyn PackageIndex>) -> Self {
        Self {
            package: package.into(),
            index,
            variants: vec![Variant::core()],
            policy: RetryPolicy::default(),
            parallel: false,
        }
    }

    pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
        self.variants = variants;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Check variants concurrently instead of one after another.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub async fn verify(&self, version: &Version) -> VerificationReport {
        let variants = if self.parallel {
            futures::future::join_all(
                self.variants
                    .iter()
                    .map(|variant| self.verify_variant(variant, version)),
            )
            .await
        } else {
            let mut reports = Vec::with_capacity(self.variants.len());
            for variant in &self.variants {
                reports.push(self.verify_variant(variant, version).await);
            }
            reports
        };
        VerificationReport { variants }
    }

    /// Run the attempt sequence for one variant until success, a fatal
    /// failure, or the budget runs out.
    pub async fn verify_variant(&self, variant: &Variant, version: &Version) -> VariantReport {
        let request = InstallRequest {
            package: self.package.clone(),
            variant: variant.clone(),
            version: *version,
        };
        let expected = version.to_string();
        let max_attempts = self.policy.attempts();
        let mut attempts = Vec::new();

        for attempt_number in 1..=max_attempts {
            let outcome = self.attempt(&request, &expected).await;

            METRICS.inc_install_attempts();
            obs::emit_install_attempt(&variant.name, attempt_number, outcome.label());

            let attempt = VerificationAttempt {
                variant: variant.name.clone(),
                attempt_number,
                outcome,
                timestamp: Utc::now(),
            };
            let outcome = attempt.outcome.clone();
            if let Some(err) = attempt.error() {
                warn!(event = "verify.attempt_failed", error = %err);
            }
            attempts.push(attempt);

            match outcome {
                AttemptOutcome::Success => {
                    info!(
                        event = "verify.variant_passed",
                        variant = %variant.name,
                        attempts = attempt_number,
                    );
                    return VariantReport {
                        variant: variant.name.clone(),
                        requirement: request.requirement(),
                        passed: true,
                        attempts,
                        error: None,
                    };
                }
                AttemptOutcome::FatalFailure { reason } => {
                    return VariantReport {
                        variant: variant.name.clone(),
                        requirement: request.requirement(),
                        passed: false,
                        attempts,
                        error: Some(reason),
                    };
                }
                AttemptOutcome::TransientFailure { .. } if attempt_number < max_attempts => {
                    tokio::time::sleep(self.policy.wait).await;
                }
                AttemptOutcome::TransientFailure { .. } => {}
            }
        }

        let last = attempts
            .last()
            .and_then(|a| match &a.outcome {
                AttemptOutcome::TransientFailure { reason } => Some(reason.clone()),
                _ => None,
            })
            .unwrap_or_default();
        VariantReport {
            variant: variant.name.clone(),
            requirement: request.requirement(),
            passed: false,
            attempts,
            error: Some(format!(
                "retry budget exhausted after {max_attempts} attempts; last error: {last}"
            )),
        }
    }

    async fn attempt(&self, request: &InstallRequest, expected: &str) -> AttemptOutcome {
        let timeout = self.policy.attempt_timeout;
        let result = match tokio::time::timeout(timeout, self.index.install(request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(InstallError::Timeout {
                after_ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(installed) if installed.reported_version == expected => AttemptOutcome::Success,
            Ok(installed) => AttemptOutcome::FatalFailure {
                reason: format!(
                    "installed package reports version {}, expected {expected}",
                    installed.reported_version
                ),
            },
            Err(e) => match (self.policy.classify)(&e) {
                ErrorClass::Transient => AttemptOutcome::TransientFailure {
                    reason: e.to_string(),
                },
                ErrorClass::Fatal => AttemptOutcome::FatalFailure {
                    reason: e.to_string(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::fakes::MemoryIndex;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            wait: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(60),
            classify: classify_all_transient,
        }
    }

    #[test]
    fn test_strict_classifier() {
        assert_eq!(
            classify_strict(&InstallError::Timeout { after_ms: 1 }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_strict(&InstallError::Failed("resolver".into())),
            ErrorClass::Fatal
        );
        assert_eq!(
            classify_all_transient(&InstallError::Failed("resolver".into())),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(quick_policy(0).attempts(), 1);
    }

    #[tokio::test]
    async fn test_no_variants_does_not_pass() {
        let index = Arc::new(MemoryIndex::new("mem://staging"));
        let version = Version::final_release(2, 0, 0);
        index.mark_published("demo", &version);

        let report = InstallVerifier::new("demo", index.clone())
            .with_variants(Vec::new())
            .verify(&version)
            .await;

        assert!(report.variants.is_empty());
        assert!(!report.passed());
        assert_eq!(index.install_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let index = Arc::new(MemoryIndex::new("mem://staging"));
        let version = Version::final_release(2, 0, 0);
        index.mark_published("demo", &version);

        let verifier = InstallVerifier::new("demo", index.clone()).with_policy(quick_policy(3));
        let report = verifier.verify(&version).await;

        assert!(report.passed());
        assert_eq!(report.total_attempts(), 1);
        assert_eq!(report.variants[0].requirement, "demo==2.0.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_classification_stops_retrying() {
        let index = Arc::new(MemoryIndex::new("mem://staging"));
        index.script_install(
            "core",
            vec![Err(InstallError::Failed("no matching distribution".into()))],
        );
        let policy = RetryPolicy {
            classify: classify_strict,
            ..quick_policy(5)
        };

        let verifier = InstallVerifier::new("demo", index.clone()).with_policy(policy);
        let report = verifier.verify(&Version::final_release(2, 0, 0)).await;

        assert!(!report.passed());
        assert_eq!(report.variants[0].attempts.len(), 1);
        assert_eq!(
            report.first_failure().map(|e| e.kind()),
            Some(ErrorKind::FatalFailure)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let index = Arc::new(
            MemoryIndex::new("mem://staging").with_install_latency(Duration::from_secs(600)),
        );
        let version = Version::final_release(2, 0, 0);
        index.mark_published("demo", &version);

        let verifier = InstallVerifier::new("demo", index.clone()).with_policy(quick_policy(2));
        let report = verifier.verify(&version).await;

        let variant = &report.variants[0];
        assert!(!variant.passed);
        assert_eq!(variant.attempts.len(), 2);
        assert!(matches!(
            variant.attempts[0].outcome,
            AttemptOutcome::TransientFailure { ref reason } if reason.contains("timed out")
        ));
        assert!(variant
            .error
            .as_deref()
            .unwrap()
            .starts_with("retry budget exhausted after 2 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_keeps_declaration_order() {
        let index = Arc::new(MemoryIndex::new("mem://staging"));
        let version = Version::final_release(2, 0, 0);
        index.mark_published("demo", &version);
        let variants = crate::index::default_variants(&["audio".into(), "plot".into()]);

        let verifier = InstallVerifier::new("demo", index.clone())
            .with_variants(variants)
            .with_policy(quick_policy(1))
            .parallel(true);
        let report = verifier.verify(&version).await;

        let names: Vec<&str> = report.variants.iter().map(|v| v.variant.as_str()).collect();
        assert_eq!(names, ["core", "core+audio", "core+plot", "core+all"]);
        assert!(report.passed());
        assert_eq!(report.variants[3].requirement, "demo[audio,plot]==2.0.0");
    }

    #[test]
    fn test_attempt_error_mapping() {
        let attempt = VerificationAttempt {
            variant: "core".into(),
            attempt_number: 2,
            outcome: AttemptOutcome::TransientFailure {
                reason: "connection refused".into(),
            },
            timestamp: Utc::now(),
        };
        assert_eq!(
            attempt.error(),
            Some(ReleaseError::TransientFailure {
                variant: "core".into(),
                attempt: 2,
                reason: "connection refused".into(),
            })
        );
    }
}
