//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for queue
//! operations: submissions, executions, claims, retries and reclaims.
//!
//! # Example
//!
//! ```ignore
//! use jobforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Create a collector for recording metrics
//! let collector = MetricsCollector::new();
//! collector.record_enqueued("scrape_video");
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

// Re-export key types for convenient access
pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

// Re-export metric constants for direct access when needed
pub use self::prometheus::{
    ACTIVE_WORKERS, CLAIM_CONFLICTS, CLAIM_LATENCY, QUEUE_DEPTH, RECLAIMED_TOTAL, REGISTRY,
    RETRIES_TOTAL, TASKS_IN_PROGRESS, TASKS_TOTAL, TASK_DURATION,
};
