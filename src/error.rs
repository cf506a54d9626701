//! Error types for jobforge operations.
//!
//! The taxonomy mirrors how each failure is handled:
//! - `ValidationError`: malformed submissions, rejected before a task exists
//! - `StorageError`: persistence faults, always fatal to the caller
//! - `QueueError`: the top-level error returned by queue components
//! - `ExecutionError`: failures raised by task executors, classified by the
//!   retry manager rather than propagated
//!
//! Lost claim races (`QueueError::ClaimConflict`) are recovered inside the
//! claimer and never reach a submitter.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::config::ConfigError;
use crate::scheduler::task::{TaskId, TaskStatus};

/// Errors raised when a submission does not satisfy its task type's schema.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Task type must not be empty")]
    EmptyTaskType,

    #[error("Unknown task type '{0}'")]
    UnknownTaskType(String),

    #[error("Invalid parameters for task type '{task_type}': {reason}")]
    InvalidParameters { task_type: String, reason: String },

    #[error("Priority {priority} is outside the allowed range [{min}, {max}]")]
    PriorityOutOfRange { priority: i32, min: i32, max: i32 },

    #[error("Task type '{0}' is already registered")]
    DuplicateTaskType(String),
}

/// Errors raised by the persistence layer.
///
/// These indicate a broken deployment (disk full, corrupt file, locked
/// database) and are never retried inside the store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt row in '{table}': {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

/// Top-level error for queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Task {task_id} was claimed by another worker")]
    ClaimConflict { task_id: TaskId },

    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Storage(StorageError::Database(err))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Storage(StorageError::Serialization(err))
    }
}

/// Hint describing why an executor failed.
///
/// Classifiers use the hint to decide between retrying and dead-lettering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job exceeded its execution budget.
    Timeout,
    /// A downstream resource was temporarily exhausted (rate limit, pool).
    ResourceExhausted,
    /// A network call failed.
    Network,
    /// The parameters could not be processed.
    InvalidInput,
    /// A bug or broken invariant inside the job body.
    Logic,
    /// The executor honoured a cancellation request.
    Cancelled,
    /// Anything else.
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceExhausted => "resource_exhausted",
            FailureKind::Network => "network",
            FailureKind::InvalidInput => "invalid_input",
            FailureKind::Logic => "logic",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Error returned by a task executor.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    /// Human-readable description, stored on the task when it dead-letters.
    pub message: String,
    /// Failure category used by the classifier.
    pub kind: FailureKind,
    /// Optional structured context recorded in the task log.
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

impl ExecutionError {
    /// Creates an error with an explicit kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            detail: None,
        }
    }

    /// Creates an error for a timed-out execution.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// Creates an error for a network failure.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Network, message)
    }

    /// Creates an error for input the job cannot process.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    /// Creates an error for a logic failure.
    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Logic, message)
    }

    /// Creates the error an executor returns after observing cancellation.
    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "execution cancelled")
    }

    /// Attaches structured detail.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Returns whether this error reports a cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

/// Storage failures inside a job body are worth another attempt.
impl From<StorageError> for ExecutionError {
    fn from(e: StorageError) -> Self {
        Self::new(FailureKind::ResourceExhausted, format!("storage: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::PriorityOutOfRange {
            priority: 500,
            min: 0,
            max: 100,
        };
        assert!(err.to_string().contains("500"));

        let err = ValidationError::InvalidParameters {
            task_type: "scrape".to_string(),
            reason: "missing field `url`".to_string(),
        };
        assert!(err.to_string().contains("scrape"));
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_queue_error_wraps_validation() {
        let err: QueueError = ValidationError::UnknownTaskType("nope".to_string()).into();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_execution_error_constructors() {
        let err = ExecutionError::timeout("took too long");
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(err.to_string(), "timeout: took too long");

        let err = ExecutionError::cancelled();
        assert!(err.is_cancelled());

        let err = ExecutionError::logic("bad state").with_detail(serde_json::json!({"step": 3}));
        assert_eq!(err.detail, Some(serde_json::json!({"step": 3})));
    }

    #[test]
    fn test_failure_kind_serialization() {
        let json = serde_json::to_string(&FailureKind::ResourceExhausted).expect("serialize");
        assert_eq!(json, "\"resource_exhausted\"");
        assert_eq!(FailureKind::Network.to_string(), "network");
    }
}
