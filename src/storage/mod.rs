//! SQLite persistent storage.
//!
//! This module provides the durable state of the queue: tasks, worker
//! heartbeats and the append-only task log, plus read-only views used for
//! monitoring.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **TaskStore**: sqlx SQLite client with the compare-and-swap `transition`
//! - **Migrations**: schema management and versioning
//! - **Views**: queue depth, active workers, per-type rates, throughput and fairness
//!
//! # Usage
//!
//! ```rust,ignore
//! use jobforge::storage::{TaskFilter, TaskStore};
//! use jobforge::scheduler::{NewTask, TaskStatus};
//!
//! let store = TaskStore::connect("sqlite://jobforge.db", 8, registry).await?;
//! store.run_migrations().await?;
//!
//! let id = store.enqueue(NewTask::new("echo", serde_json::json!({}))).await?;
//!
//! let filter = TaskFilter::new()
//!     .with_status(TaskStatus::Queued)
//!     .with_limit(10);
//! let tasks = store.list_by_filter(&filter).await?;
//!
//! let window = std::time::Duration::from_secs(3600);
//! let stats = store.views().snapshot(std::time::Duration::from_secs(30), window).await?;
//! ```

pub mod database;
pub mod migrations;
pub mod schema;
pub mod views;

// Re-export main types for convenience
pub use database::{CancelOutcome, TaskFilter, TaskStore};
pub use migrations::{AppliedMigration, MigrationRunner};
pub use views::{QueueDepth, QueueStats, QueueViews, Throughput, TypeRates};
