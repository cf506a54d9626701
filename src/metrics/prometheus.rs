//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by jobforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Serializes `init_metrics` so the statics always come from one registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task lifecycle events, labeled by resulting status and task type.
pub static TASKS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Task execution duration in seconds, labeled by task type.
pub static TASK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of tasks in the store, labeled by status.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of tasks currently executing in this process.
pub static TASKS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of workers with a fresh heartbeat.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Time spent in one claim attempt, in seconds.
pub static CLAIM_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Compare-and-swap losses during claims.
pub static CLAIM_CONFLICTS: OnceLock<Counter> = OnceLock::new();

/// Retries scheduled, labeled by task type.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Tasks taken back from stale or vanished workers.
pub static RECLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. It creates all
/// metric instances with appropriate labels and buckets, and registers them
/// with the global Prometheus registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Task metrics
    let tasks_total = CounterVec::new(
        Opts::new("jobforge_tasks_total", "Task lifecycle events by resulting status"),
        &["status", "task_type"],
    )?;

    let task_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "jobforge_task_duration_seconds",
            "Task execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0]),
        &["task_type"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("jobforge_queue_depth", "Number of tasks by status"),
        &["status"],
    )?;

    let tasks_in_progress = Gauge::new(
        "jobforge_tasks_in_progress",
        "Number of tasks currently executing",
    )?;

    // Claim metrics
    let claim_latency = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "jobforge_claim_latency_seconds",
            "Time spent in one claim attempt",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
    )?;

    let claim_conflicts = Counter::new(
        "jobforge_claim_conflicts_total",
        "Claims lost to a concurrent worker",
    )?;

    // Recovery metrics
    let retries_total = CounterVec::new(
        Opts::new("jobforge_retries_total", "Retries scheduled"),
        &["task_type"],
    )?;

    let reclaimed_total = Counter::new(
        "jobforge_reclaimed_total",
        "Tasks reclaimed from stale workers",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("jobforge_active_workers", "Number of active workers")?;

    // Register all metrics with the registry
    registry.register(Box::new(tasks_total.clone()))?;
    registry.register(Box::new(task_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(tasks_in_progress.clone()))?;
    registry.register(Box::new(claim_latency.clone()))?;
    registry.register(Box::new(claim_conflicts.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(reclaimed_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = TASKS_TOTAL.set(tasks_total);
    let _ = TASK_DURATION.set(task_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = TASKS_IN_PROGRESS.set(tasks_in_progress);
    let _ = CLAIM_LATENCY.set(claim_latency);
    let _ = CLAIM_CONFLICTS.set(claim_conflicts);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = RECLAIMED_TOTAL.set(reclaimed_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(counter) = TASKS_TOTAL.get() {
            counter.with_label_values(&["queued", "echo"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("jobforge_tasks_total"));
    }
}
