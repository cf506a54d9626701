//! jobforge: durable task queue with pluggable scheduling policies.
//!
//! Tasks are stored in SQLite and claimed by workers through a
//! compare-and-swap on their status. Workers heartbeat while they run, and
//! a health monitor takes tasks back from workers that stop heartbeating.

// Core modules
pub mod cli;
pub mod clock;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use error::{ExecutionError, FailureKind, QueueError, StorageError, ValidationError};
pub use scheduler::{
    NewTask, QueueConfig, SchedulingPolicy, Task, TaskId, TaskOutcome, TaskQueue, TaskRegistry,
    TaskStatus, WorkerPool,
};
pub use storage::TaskStore;
