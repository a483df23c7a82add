use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::task::{BuildResult, BuildStatus};

/// Lock-free build counters.
#[derive(Debug, Default)]
pub struct BuildMetrics {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    circuit_open: AtomicU64,
    cancelled: AtomicU64,
    cache_hits: AtomicU64,
    total_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub circuit_open: u64,
    pub cancelled: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl BuildMetrics {
    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record(&self, result: &BuildResult) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let counter = match result.status {
            BuildStatus::Succeeded => &self.succeeded,
            BuildStatus::Failed => &self.failed,
            BuildStatus::CircuitOpen { .. } => &self.circuit_open,
            BuildStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if result.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.total_micros
            .fetch_add(result.duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let completed = load(&self.completed);
        let succeeded = load(&self.succeeded);
        let failed = load(&self.failed);
        let cache_hits = load(&self.cache_hits);

        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        // Circuit-open and cancelled results never ran the compiler
        let attempted = succeeded + failed;

        MetricsSnapshot {
            submitted: load(&self.submitted),
            rejected: load(&self.rejected),
            completed,
            succeeded,
            failed,
            circuit_open: load(&self.circuit_open),
            cancelled: load(&self.cancelled),
            cache_hits,
            cache_hit_rate: ratio(cache_hits, attempted),
            success_rate: ratio(succeeded, attempted),
            average_duration: Duration::from_micros(
                load(&self.total_micros).checked_div(completed).unwrap_or(0),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::task::BuildTask;
    use crate::utils::hash::Fingerprint;
    use std::path::PathBuf;
    use std::time::Instant;

    fn result(status: BuildStatus, cache_hit: bool, millis: u64) -> BuildResult {
        BuildResult {
            task: BuildTask {
                id: 0,
                component: "A".into(),
                path: PathBuf::from("a.component"),
                fingerprint: Fingerprint::default(),
                enqueued_at: Instant::now(),
            },
            status,
            errors: Vec::new(),
            duration: Duration::from_millis(millis),
            cache_hit,
        }
    }

    #[test]
    fn test_rates() {
        let metrics = BuildMetrics::default();
        metrics.record(&result(BuildStatus::Succeeded, true, 10));
        metrics.record(&result(BuildStatus::Succeeded, false, 30));
        metrics.record(&result(BuildStatus::Failed, false, 20));
        metrics.record(&result(
            BuildStatus::CircuitOpen {
                retry_in: Duration::ZERO,
            },
            false,
            0,
        ));

        let snap = metrics.snapshot();
        assert_eq!(snap.completed, 4);
        assert_eq!(snap.circuit_open, 1);
        assert!((snap.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((snap.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(snap.average_duration, Duration::from_millis(15));
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = BuildMetrics::default().snapshot();
        assert_eq!(snap.success_rate, 0.0);
        assert_eq!(snap.average_duration, Duration::ZERO);
    }
}
