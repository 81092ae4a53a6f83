//! Observability surface: named, atomically-updated counters and
//! histograms per component, registered once at startup. No OTLP/file
//! exporter is wired up — only the in-process surface a caller could
//! export from is in scope.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-component counters and gauges. Histograms are represented as a
/// running count + sum so a caller can derive an average
/// without this crate taking a dependency on a specific metrics backend.
#[derive(Default)]
pub struct Metrics {
    pub retrieval_hits_total: Counter,
    pub retrieval_latency_seconds_sum: AtomicU64,
    pub retrieval_latency_count: Counter,
    pub workflow_cancellations_total: Counter,
    pub workflow_step_duration_seconds_sum: AtomicU64,
    pub workflow_step_duration_count: Counter,
    pub policy_denials_total: DashMap<String, Counter>,
    pub audit_append_total: DashMap<String, Counter>,
    pub breaker_state: DashMap<String, AtomicU64>,
    pub pool_in_use: AtomicU64,
    pub pool_waiting: AtomicU64,
}

impl Metrics {
    pub fn record_retrieval_latency(&self, seconds: f64) {
        self.retrieval_latency_seconds_sum.fetch_add((seconds * 1000.0) as u64, Ordering::Relaxed);
        self.retrieval_latency_count.inc();
    }

    pub fn record_policy_denial(&self, reason: &str) {
        self.policy_denials_total.entry(reason.to_string()).or_default().inc();
    }

    pub fn record_audit_append(&self, stream: &str) {
        self.audit_append_total.entry(stream.to_string()).or_default().inc();
    }

    pub fn set_breaker_state(&self, key: &str, state: u64) {
        self.breaker_state.entry(key.to_string()).or_insert_with(|| AtomicU64::new(0)).store(state, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let metrics = Metrics::default();
        metrics.record_policy_denial("scope_not_permitted_for_mode");
        metrics.record_policy_denial("scope_not_permitted_for_mode");
        assert_eq!(metrics.policy_denials_total.get("scope_not_permitted_for_mode").unwrap().get(), 2);
    }
}
