//! Lightweight metrics for the orchestration core.
//!
//! Atomic counters read by the `/metrics` endpoint and rendered in the
//! Prometheus text format. All counters use relaxed ordering — they are
//! approximate gauges read periodically, so strict ordering isn't needed.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use std::time::Instant;

pub struct OrchestratorMetrics {
    /// Sandboxes created across all providers since startup.
    pub sandboxes_created: AtomicU64,
    /// Sandboxes terminated since startup.
    pub sandboxes_terminated: AtomicU64,
    /// Current number of live sandboxes (created - terminated).
    pub active_sandboxes: AtomicU64,
    /// Pool claims satisfied from the warm pool.
    pub pool_hits: AtomicU64,
    /// Pool claims that fell through to a cold start.
    pub pool_misses: AtomicU64,
    /// Pool entries expired by the TTL sweep.
    pub pool_expired: AtomicU64,
    /// Image builds completed successfully.
    pub builds_completed: AtomicU64,
    /// Image builds that failed (any stage).
    pub builds_failed: AtomicU64,
    /// Snapshots recorded.
    pub snapshots_created: AtomicU64,
    /// Snapshots expired by TTL or explicit expire.
    pub snapshots_expired: AtomicU64,
    /// Snapshots restored into fresh sandboxes.
    pub snapshots_restored: AtomicU64,
    /// Write tool calls blocked by the sync gate.
    pub writes_blocked: AtomicU64,
    /// Blocked write tool calls eventually released.
    pub writes_released: AtomicU64,
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorMetrics {
    pub const fn new() -> Self {
        Self {
            sandboxes_created: AtomicU64::new(0),
            sandboxes_terminated: AtomicU64::new(0),
            active_sandboxes: AtomicU64::new(0),
            pool_hits: AtomicU64::new(0),
            pool_misses: AtomicU64::new(0),
            pool_expired: AtomicU64::new(0),
            builds_completed: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            snapshots_expired: AtomicU64::new(0),
            snapshots_restored: AtomicU64::new(0),
            writes_blocked: AtomicU64::new(0),
            writes_released: AtomicU64::new(0),
        }
    }

    pub fn record_sandbox_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        self.active_sandboxes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sandbox_terminated(&self) {
        self.sandboxes_terminated.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_sandboxes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Snapshot all counters as key-value pairs.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("sandboxes_created", self.sandboxes_created.load(Ordering::Relaxed)),
            ("sandboxes_terminated", self.sandboxes_terminated.load(Ordering::Relaxed)),
            ("active_sandboxes", self.active_sandboxes.load(Ordering::Relaxed)),
            ("pool_hits", self.pool_hits.load(Ordering::Relaxed)),
            ("pool_misses", self.pool_misses.load(Ordering::Relaxed)),
            ("pool_expired", self.pool_expired.load(Ordering::Relaxed)),
            ("builds_completed", self.builds_completed.load(Ordering::Relaxed)),
            ("builds_failed", self.builds_failed.load(Ordering::Relaxed)),
            ("snapshots_created", self.snapshots_created.load(Ordering::Relaxed)),
            ("snapshots_expired", self.snapshots_expired.load(Ordering::Relaxed)),
            ("snapshots_restored", self.snapshots_restored.load(Ordering::Relaxed)),
            ("writes_blocked", self.writes_blocked.load(Ordering::Relaxed)),
            ("writes_released", self.writes_released.load(Ordering::Relaxed)),
        ]
    }

    /// Render counters in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.snapshot() {
            out.push_str(&format!("# TYPE orchestrator_{name} counter\n"));
            out.push_str(&format!("orchestrator_{name} {value}\n"));
        }
        out
    }
}

static METRICS: OrchestratorMetrics = OrchestratorMetrics::new();
static STARTED_AT: Lazy<Instant> = Lazy::new(Instant::now);

/// Returns the global metrics tracker.
pub fn metrics() -> &'static OrchestratorMetrics {
    &METRICS
}

pub fn uptime_secs() -> u64 {
    STARTED_AT.elapsed().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_render_includes_counters() {
        let m = OrchestratorMetrics::new();
        m.record_sandbox_created();
        m.pool_hits.fetch_add(3, Ordering::Relaxed);
        let body = m.render_prometheus();
        assert!(body.contains("orchestrator_active_sandboxes 1"));
        assert!(body.contains("orchestrator_pool_hits 3"));
    }

    #[test]
    fn active_count_never_underflows() {
        let m = OrchestratorMetrics::new();
        m.record_sandbox_terminated();
        assert_eq!(m.active_sandboxes.load(Ordering::Relaxed), 0);
    }
}
