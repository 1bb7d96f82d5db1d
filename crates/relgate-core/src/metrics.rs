//! Process-wide atomic counters for pipeline observability.
//!
//! Counters only grow. A run takes a [`MetricsSnapshot`] when it starts and
//! logs the difference with [`Metrics::flush_since`] when it ends, so the
//! flushed values cover that run (plus anything that ran concurrently in the
//! same process).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    jobs_executed: AtomicU64,
    jobs_short_circuited: AtomicU64,
    uploads: AtomicU64,
    install_attempts: AtomicU64,
}

/// Counter values at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub jobs_executed: u64,
    pub jobs_short_circuited: u64,
    pub uploads: u64,
    pub install_attempts: u64,
}

impl MetricsSnapshot {
    /// Per-counter growth from `earlier` to `self`.
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_executed: self.jobs_executed.saturating_sub(earlier.jobs_executed),
            jobs_short_circuited: self
                .jobs_short_circuited
                .saturating_sub(earlier.jobs_short_circuited),
            uploads: self.uploads.saturating_sub(earlier.uploads),
            install_attempts: self.install_attempts.saturating_sub(earlier.install_attempts),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_executed: AtomicU64::new(0),
            jobs_short_circuited: AtomicU64::new(0),
            uploads: AtomicU64::new(0),
            install_attempts: AtomicU64::new(0),
        }
    }

    /// A job executor was invoked.
    pub fn inc_jobs_executed(&self) {
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_executed", "counter incremented");
    }

    /// A job was failed by upstream propagation or cancellation.
    pub fn inc_jobs_short_circuited(&self) {
        self.jobs_short_circuited.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_short_circuited", "counter incremented");
    }

    pub fn inc_uploads(&self) {
        self.uploads.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "uploads", "counter incremented");
    }

    pub fn inc_install_attempts(&self) {
        self.install_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "install_attempts", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_executed: self.jobs_executed.load(Ordering::Relaxed),
            jobs_short_circuited: self.jobs_short_circuited.load(Ordering::Relaxed),
            uploads: self.uploads.load(Ordering::Relaxed),
            install_attempts: self.install_attempts.load(Ordering::Relaxed),
        }
    }

    /// Emit the growth since `start` as a single `info!` event and return it.
    pub fn flush_since(&self, start: &MetricsSnapshot) -> MetricsSnapshot {
        let delta = self.snapshot().since(start);
        tracing::info!(
            metric = "flush",
            jobs_executed = delta.jobs_executed,
            jobs_short_circuited = delta.jobs_short_circuited,
            uploads = delta.uploads,
            install_attempts = delta.install_attempts,
        );
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
        m.inc_jobs_executed();
        m.inc_jobs_executed();
        m.inc_jobs_short_circuited();
        m.inc_install_attempts();

        let snap = m.snapshot();
        assert_eq!(snap.jobs_executed, 2);
        assert_eq!(snap.jobs_short_circuited, 1);
        assert_eq!(snap.install_attempts, 1);
        assert_eq!(snap.uploads, 0);
    }

    #[test]
    fn flush_reports_growth_since_start() {
        let m = Metrics::new();
        m.inc_jobs_executed();
        m.inc_uploads();

        let start = m.snapshot();
        m.inc_jobs_executed();
        m.inc_install_attempts();
        m.inc_install_attempts();

        let delta = m.flush_since(&start);
        assert_eq!(
            delta,
            MetricsSnapshot {
                jobs_executed: 1,
                jobs_short_circuited: 0,
                uploads: 0,
                install_attempts: 2,
            }
        );
    }
}
