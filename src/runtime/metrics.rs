//! Engine-wide counters
//!
//! Fed by the dispatch loop (node outcomes and retries), by `drive` when an
//! execution finishes, and by the breaker registry's state-change callback.
//! Counters only ever grow; [`EngineMetrics::snapshot`] derives the averages
//! and rates.

use crate::resilience::{BreakerState, StateChangeCallback};
use crate::runtime::execution::{ExecutionStatus, NodeStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EngineMetrics {
    workflows_executed: AtomicU64,
    workflows_succeeded: AtomicU64,
    workflows_failed: AtomicU64,
    workflows_cancelled: AtomicU64,
    workflows_timed_out: AtomicU64,
    workflow_nanos: AtomicU64,

    nodes_executed: AtomicU64,
    nodes_succeeded: AtomicU64,
    nodes_failed: AtomicU64,
    node_nanos: AtomicU64,

    breaker_trips: AtomicU64,
    breaker_resets: AtomicU64,

    retries: AtomicU64,
    successful_retries: AtomicU64,
}

/// Point-in-time view, serialisable for status endpoints and logs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub workflows_executed: u64,
    pub workflows_succeeded: u64,
    pub workflows_failed: u64,
    pub workflows_cancelled: u64,
    pub workflows_timed_out: u64,
    pub nodes_executed: u64,
    pub nodes_succeeded: u64,
    pub nodes_failed: u64,
    pub breaker_trips: u64,
    pub breaker_resets: u64,
    pub total_retries: u64,
    pub successful_retries: u64,
    pub avg_workflow_duration_ms: u64,
    pub avg_node_duration_ms: u64,
    pub workflow_success_rate: f64,
    pub node_success_rate: f64,
    pub retry_success_rate: f64,
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn average_ms(total_nanos: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        total_nanos / count / 1_000_000
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One execution reached a terminal status
    pub fn record_workflow(&self, status: ExecutionStatus, duration: Duration) {
        self.workflows_executed.fetch_add(1, Ordering::Relaxed);
        self.workflow_nanos.fetch_add(nanos(duration), Ordering::Relaxed);
        let counter = match status {
            ExecutionStatus::Succeeded => &self.workflows_succeeded,
            ExecutionStatus::Cancelled => &self.workflows_cancelled,
            ExecutionStatus::Timeout => &self.workflows_timed_out,
            _ => &self.workflows_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A node that actually ran finished. Nodes settled without running
    /// (skipped, cancelled while queued) are not counted.
    pub fn record_node(&self, status: NodeStatus, retries: u32, duration: Duration) {
        self.nodes_executed.fetch_add(1, Ordering::Relaxed);
        self.node_nanos.fetch_add(nanos(duration), Ordering::Relaxed);
        if status == NodeStatus::Completed {
            self.nodes_succeeded.fetch_add(1, Ordering::Relaxed);
            // The last retry is the one that got through
            if retries > 0 {
                self.successful_retries.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.nodes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_transition(&self, from: BreakerState, to: BreakerState) {
        match (from, to) {
            (_, BreakerState::Open) => {
                self.breaker_trips.fetch_add(1, Ordering::Relaxed);
            }
            (BreakerState::HalfOpen, BreakerState::Closed) => {
                self.breaker_resets.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Callback for [`BreakerRegistry::with_callback`](crate::resilience::BreakerRegistry::with_callback)
    pub fn breaker_callback(self: &Arc<Self>) -> StateChangeCallback {
        let metrics = Arc::clone(self);
        Arc::new(move |_name: &str, from: BreakerState, to: BreakerState| {
            metrics.record_breaker_transition(from, to);
        })
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let workflows_executed = load(&self.workflows_executed);
        let workflows_succeeded = load(&self.workflows_succeeded);
        let nodes_executed = load(&self.nodes_executed);
        let nodes_succeeded = load(&self.nodes_succeeded);
        let total_retries = load(&self.retries);
        let successful_retries = load(&self.successful_retries);

        MetricsSnapshot {
            workflows_executed,
            workflows_succeeded,
            workflows_failed: load(&self.workflows_failed),
            workflows_cancelled: load(&self.workflows_cancelled),
            workflows_timed_out: load(&self.workflows_timed_out),
            nodes_executed,
            nodes_succeeded,
            nodes_failed: load(&self.nodes_failed),
            breaker_trips: load(&self.breaker_trips),
            breaker_resets: load(&self.breaker_resets),
            total_retries,
            successful_retries,
            avg_workflow_duration_ms: average_ms(load(&self.workflow_nanos), workflows_executed),
            avg_node_duration_ms: average_ms(load(&self.node_nanos), nodes_executed),
            workflow_success_rate: ratio(workflows_succeeded, workflows_executed),
            node_success_rate: ratio(nodes_succeeded, nodes_executed),
            retry_success_rate: ratio(successful_retries, total_retries),
        }
    }
}
