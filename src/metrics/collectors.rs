//! Custom metric collectors for queue operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with methods named
//! after queue events. Every method is a no-op until `init_metrics()` has
//! run, so library users and tests never need a registry.

use crate::scheduler::task::TaskStatus;

use super::prometheus::{
    ACTIVE_WORKERS, CLAIM_CONFLICTS, CLAIM_LATENCY, QUEUE_DEPTH, RECLAIMED_TOTAL, RETRIES_TOTAL,
    TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};

/// Metrics collector for recording queue operational metrics.
///
/// # Example
///
/// ```ignore
/// use jobforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_enqueued("scrape_video");
/// collector.observe_duration("scrape_video", 12.5);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a new submission.
    pub fn record_enqueued(&self, task_type: &str) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total.with_label_values(&["queued", task_type]).inc();
        }
    }

    /// Record a task reaching a terminal status.
    pub fn record_finished(&self, task_type: &str, status: TaskStatus) {
        if let Some(tasks_total) = TASKS_TOTAL.get() {
            tasks_total
                .with_label_values(&[status.as_str(), task_type])
                .inc();
        }
    }

    /// Record how long one execution took.
    pub fn observe_duration(&self, task_type: &str, duration_secs: f64) {
        if let Some(task_duration) = TASK_DURATION.get() {
            task_duration
                .with_label_values(&[task_type])
                .observe(duration_secs);
        }

        tracing::trace!(
            task_type = task_type,
            duration_secs = duration_secs,
            "Recorded execution duration"
        );
    }

    /// Record a scheduled retry.
    pub fn record_retry(&self, task_type: &str) {
        if let Some(retries_total) = RETRIES_TOTAL.get() {
            retries_total.with_label_values(&[task_type]).inc();
        }
    }

    /// Record one claim attempt and the conflicts it ran into.
    pub fn record_claim(&self, latency_secs: f64, conflicts: u64) {
        if let Some(claim_latency) = CLAIM_LATENCY.get() {
            claim_latency.observe(latency_secs);
        }
        if conflicts > 0 {
            if let Some(claim_conflicts) = CLAIM_CONFLICTS.get() {
                claim_conflicts.inc_by(conflicts as f64);
            }
        }
    }

    /// Record tasks reclaimed from dead workers.
    pub fn record_reclaimed(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(reclaimed_total) = RECLAIMED_TOTAL.get() {
            reclaimed_total.inc_by(count as f64);
        }
    }

    /// Set the task count of one status.
    pub fn set_queue_depth(&self, status: TaskStatus, count: i64) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[status.as_str()])
                .set(count as f64);
        }
    }

    /// Mark the start of an execution.
    pub fn task_started(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    /// Mark the end of an execution.
    pub fn task_finished(&self) {
        if let Some(in_progress) = TASKS_IN_PROGRESS.get() {
            in_progress.dec();
        }
    }

    /// Set the number of live workers.
    pub fn set_active_workers(&self, count: i64) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }
    }
}
