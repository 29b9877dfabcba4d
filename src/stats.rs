//! Usage statistics
//!
//! Request counters for the `/stats` surface: totals, per-route and
//! per-pipeline counts, all lock-free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::flow::FlowSnapshot;

/// Gateway-wide usage counters.
pub struct UsageStats {
    started_at: Instant,
    total_requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    per_route: DashMap<String, AtomicU64>,
    per_pipeline: DashMap<String, AtomicU64>,
}

impl Default for UsageStats {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageStats {
    /// Create a fresh counter set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            per_route: DashMap::new(),
            per_pipeline: DashMap::new(),
        }
    }

    /// Record one dispatch attempt onto a pipeline.
    pub fn record_attempt(&self, route: &str, pipeline_id: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        bump(&self.per_route, route);
        bump(&self.per_pipeline, pipeline_id);
    }

    /// Record a completed request.
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed request (after all retries).
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an alternate-pipeline retry.
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since startup.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Serializable snapshot for the stats endpoint.
    #[must_use]
    pub fn snapshot(&self, flow: FlowSnapshot) -> StatsSnapshot {
        let collect = |map: &DashMap<String, AtomicU64>| {
            let mut entries: Vec<(String, u64)> = map
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            entries
        };
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            routes: collect(&self.per_route),
            pipelines: collect(&self.per_pipeline),
            flow,
        }
    }
}

fn bump(map: &DashMap<String, AtomicU64>, key: &str) {
    map.entry(key.to_string())
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of the counters, ready to serialize.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    /// Seconds since startup
    pub uptime_secs: u64,
    /// Dispatch attempts
    pub total_requests: u64,
    /// Completed requests
    pub successes: u64,
    /// Failed requests
    pub failures: u64,
    /// Alternate-pipeline retries
    pub retries: u64,
    /// (route, attempts) sorted by count
    pub routes: Vec<(String, u64)>,
    /// (pipeline id, attempts) sorted by count
    pub pipelines: Vec<(String, u64)>,
    /// Queue depths
    pub flow: FlowSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> FlowSnapshot {
        FlowSnapshot {
            sessions: 0,
            conversations: 0,
            queued_requests: 0,
        }
    }

    #[test]
    fn counters_accumulate() {
        let stats = UsageStats::new();
        stats.record_attempt("default", "pipeline_p1_m1");
        stats.record_attempt("default", "pipeline_p1_m1");
        stats.record_attempt("tooluse", "pipeline_p2_m2");
        stats.record_success();
        stats.record_failure();
        stats.record_retry();

        let snap = stats.snapshot(flow());
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.routes[0], ("default".to_string(), 2));
        assert_eq!(snap.pipelines[0], ("pipeline_p1_m1".to_string(), 2));
    }

    #[test]
    fn snapshot_serializes() {
        let stats = UsageStats::new();
        stats.record_attempt("default", "p");
        let json = serde_json::to_value(stats.snapshot(flow())).unwrap();
        assert_eq!(json["total_requests"], 1);
        assert!(json["flow"]["sessions"].is_number());
    }
}
