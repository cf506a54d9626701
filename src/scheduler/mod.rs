//! Task scheduling: claiming, execution, retries and worker recovery.
//!
//! This module provides the moving parts of the queue:
//!
//! - **TaskQueue**: facade over the store and the components below
//! - **Claimer**: atomic claims ranked by a `SchedulingPolicy`
//! - **WorkerRuntime**: poll/claim/execute/report state machine
//! - **RetryManager**: transient/permanent classification and backoff
//! - **HealthMonitor**: heartbeat expiry and task reclamation
//! - **WorkerPool**: several runtimes plus a monitor in one process
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │  Submitter   │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐       sweep      ┌───────────────┐
//!                      │  TaskStore   │◄─────────────────│ HealthMonitor │
//!                      │   (SQLite)   │                  └───────────────┘
//!                      └──────┬───────┘
//!                             │ CAS queued -> claimed
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobforge::scheduler::{NewTask, QueueConfig, TaskQueue, TaskRegistry};
//! use std::sync::Arc;
//!
//! let mut registry = TaskRegistry::new();
//! registry.register_with_executor::<ScrapeVideo, _>(ScrapeExecutor::new())?;
//!
//! let queue = TaskQueue::open(QueueConfig::from_env()?, Arc::new(registry)).await?;
//! queue
//!     .enqueue(NewTask::new("scrape_video", serde_json::json!({"url": "https://..."})).with_priority(10))
//!     .await?;
//!
//! let mut pool = queue.worker_pool();
//! pool.start().await?;
//! // ...
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Single claimant**: claims are a compare-and-swap on the task status
//! - **Crash recovery**: tasks of workers with stale heartbeats return to the queue
//! - **Dead letter**: permanent failures and exhausted retries park in `failed`
//! - **Graceful shutdown**: workers release unfinished tasks without a retry penalty

pub mod backoff;
pub mod claimer;
pub mod config;
pub mod executor;
pub mod fairness;
pub mod health;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod task;
pub mod worker;
pub mod worker_pool;

// Re-export main types for convenience
pub use backoff::Backoff;
pub use claimer::Claimer;
pub use config::{ConfigError, QueueConfig};
pub use executor::{ExecutionContext, TaskExecutor, Typed, TypedExecutor};
pub use fairness::{gini_coefficient, jain_index, FairnessReport};
pub use health::{HealthMonitor, SweepReport};
pub use policy::{priority_weight, selection_probabilities, weighted_sample, SchedulingPolicy};
pub use queue::TaskQueue;
pub use registry::{default_classifier, FailureClass, TaskKind, TaskRegistry};
pub use retry::RetryManager;
pub use task::{
    Disposition, HeartbeatMetrics, LogEvent, NewLogEntry, NewTask, Task, TaskId, TaskLogEntry,
    TaskOutcome, TaskStatus, TaskUpdate, WorkerHeartbeat, WorkerStatus,
};
pub use worker::{generate_worker_id, PollOutcome, WorkerRuntime, WorkerState, WorkerStats};
pub use worker_pool::{PoolError, PoolStats, WorkerPool};
