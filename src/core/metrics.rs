//! Aggregate counters for gateway activity.
//!
//! Plain relaxed atomics for the counters; per-action latency summaries live
//! in a sharded map keyed by qualified action name and are mutated under the
//! shard lock. `snapshot()` is a point-in-time copy, cheap enough for a log
//! line or a stats endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::catalog::QualifiedActionName;

#[derive(Default)]
pub struct GatewayMetrics {
    total_executions: AtomicU64,
    successful_executions: AtomicU64,
    failed_executions: AtomicU64,
    active_executions: AtomicU64,
    catalog_refreshes: AtomicU64,
    searches: AtomicU64,
    connection_errors: AtomicU64,
    active_connections: AtomicU64,
    action_latencies: DashMap<QualifiedActionName, LatencySummary>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution_start(&self, _action: &QualifiedActionName) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        self.active_executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution_end(
        &self,
        action: &QualifiedActionName,
        success: bool,
        duration_ms: u64,
    ) {
        self.active_executions.fetch_sub(1, Ordering::Relaxed);
        let outcome = if success {
            &self.successful_executions
        } else {
            &self.failed_executions
        };
        outcome.fetch_add(1, Ordering::Relaxed);

        self.action_latencies
            .entry(action.clone())
            .or_default()
            .observe(duration_ms);
    }

    pub fn record_catalog_refresh(&self) {
        self.catalog_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_search(&self) {
        self.searches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_executions: self.total_executions.load(Ordering::Relaxed),
            successful_executions: self.successful_executions.load(Ordering::Relaxed),
            failed_executions: self.failed_executions.load(Ordering::Relaxed),
            active_executions: self.active_executions.load(Ordering::Relaxed),
            catalog_refreshes: self.catalog_refreshes.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    /// Latency summary for one action, if it has ever completed.
    pub fn action_latency(&self, action: &QualifiedActionName) -> Option<LatencySummary> {
        self.action_latencies.get(action).map(|summary| *summary)
    }
}

/// Running min/avg/max over one action's completed executions.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySummary {
    pub samples: u64,
    pub total_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    fn observe(&mut self, ms: u64) {
        if self.samples == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.samples += 1;
        self.total_ms += ms;
    }

    pub fn avg_ms(&self) -> u64 {
        if self.samples == 0 {
            0
        } else {
            self.total_ms / self.samples
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub active_executions: u64,
    pub catalog_refreshes: u64,
    pub searches: u64,
    pub connection_errors: u64,
    pub active_connections: u64,
}

impl MetricsSnapshot {
    /// Fraction of completed executions that succeeded, in `0.0..=1.0`.
    /// With nothing completed yet this reads as `1.0`.
    pub fn success_ratio(&self) -> f64 {
        let completed = self.successful_executions + self.failed_executions;
        if completed == 0 {
            return 1.0;
        }
        self.successful_executions as f64 / completed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action() -> QualifiedActionName {
        QualifiedActionName::new("github", "create_issue")
    }

    #[test]
    fn execution_counters_balance_start_and_end() {
        let metrics = GatewayMetrics::new();

        metrics.record_execution_start(&action());
        let mid = metrics.snapshot();
        assert_eq!((mid.total_executions, mid.active_executions), (1, 1));

        metrics.record_execution_end(&action(), true, 12);
        metrics.record_execution_start(&action());
        metrics.record_execution_end(&action(), false, 7);

        let done = metrics.snapshot();
        assert_eq!(done.active_executions, 0);
        assert_eq!(done.successful_executions, 1);
        assert_eq!(done.failed_executions, 1);
    }

    #[test]
    fn latency_summary_is_per_action() {
        let metrics = GatewayMetrics::new();
        for ms in [40, 10, 25] {
            metrics.record_execution_start(&action());
            metrics.record_execution_end(&action(), true, ms);
        }

        let summary = metrics.action_latency(&action()).unwrap();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.min_ms, 10);
        assert_eq!(summary.max_ms, 40);
        assert_eq!(summary.avg_ms(), 25);

        let other = QualifiedActionName::new("notion", "search");
        assert!(metrics.action_latency(&other).is_none());
    }

    #[test]
    fn connection_counters_move_both_ways() {
        let metrics = GatewayMetrics::new();
        metrics.record_connection_opened();
        metrics.record_connection_opened();
        metrics.record_connection_closed();
        metrics.record_connection_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.connection_errors, 1);
    }

    #[test]
    fn success_ratio_counts_only_completed_executions() {
        let metrics = GatewayMetrics::new();
        assert_eq!(metrics.snapshot().success_ratio(), 1.0);

        for success in [true, true, true, false] {
            metrics.record_execution_start(&action());
            metrics.record_execution_end(&action(), success, 5);
        }
        assert!((metrics.snapshot().success_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
