//! Task, heartbeat and audit-log records.
//!
//! This module defines the persisted entities of the queue:
//!
//! - `Task`: a unit of work and its lifecycle state
//! - `WorkerHeartbeat`: liveness record of a worker process
//! - `TaskLogEntry`: append-only audit event
//!
//! plus the value types used to create and mutate them (`NewTask`,
//! `TaskUpdate`, `TaskOutcome`).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// Lowest accepted task priority.
pub const MIN_PRIORITY: i32 = 0;

/// Highest accepted task priority.
pub const MAX_PRIORITY: i32 = 100;

/// Priority used when the submitter does not choose one.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Retry ceiling used when the submitter does not choose one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Monotonically increasing task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Returns the raw database id.
    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TaskId)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Queued,
    /// Assigned to a worker that has not started it yet.
    Claimed,
    /// Being executed.
    Running,
    /// Finished successfully.
    Completed,
    /// Dead-lettered after a permanent failure or exhausted retries.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Queued,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Returns the persisted string form.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Returns whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns whether a worker currently holds the task.
    pub fn is_held(self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    /// Returns whether `self -> next` is a legal lifecycle edge.
    ///
    /// Forward edges follow `queued -> claimed -> running -> terminal`.
    /// Held tasks may return to `queued` (retry, reclaim, release) and
    /// may be dead-lettered or cancelled from either held state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Claimed)
                | (Queued, Cancelled)
                | (Claimed, Running)
                | (Claimed, Queued)
                | (Claimed, Failed)
                | (Claimed, Cancelled)
                | (Running, Queued)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "claimed" => Ok(TaskStatus::Claimed),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// A unit of work tracked by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned identifier.
    pub id: TaskId,
    /// Tag selecting the executor and parameter schema.
    pub task_type: String,
    /// Parameters validated against the task type's schema.
    pub parameters: serde_json::Value,
    /// Higher values are more urgent.
    pub priority: i32,
    /// Earliest time the task may be claimed.
    pub run_after: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Worker holding (or that last held) the task.
    pub claimed_by: Option<String>,
    /// When the current claim was made.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Number of retries already consumed.
    pub retry_count: u32,
    /// Retry ceiling for this task.
    pub max_retries: u32,
    /// Result payload of a completed task.
    pub result: Option<serde_json::Value>,
    /// Last error message.
    pub error_message: Option<String>,
    /// Set when a cancellation was requested while the task was held.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Returns whether another retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns the number of retries left.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Returns whether the task can be claimed at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.run_after <= now
    }
}

/// Submission of a new task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: String,
    pub parameters: serde_json::Value,
    pub priority: i32,
    /// `None` means "eligible immediately".
    pub run_after: Option<DateTime<Utc>>,
    /// `None` means the deployment default.
    pub max_retries: Option<u32>,
}

impl NewTask {
    /// Creates a submission with default priority, eligibility and ceiling.
    pub fn new(task_type: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            parameters,
            priority: DEFAULT_PRIORITY,
            run_after: None,
            max_retries: None,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delays eligibility until `run_after`.
    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    /// Sets the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Field changes applied together with a status transition.
///
/// `None` leaves a column untouched. Nested options distinguish
/// "set to NULL" from "leave alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub claimed_by: Option<Option<String>>,
    pub claimed_at: Option<Option<DateTime<Utc>>>,
    pub run_after: Option<DateTime<Utc>>,
    pub retry_count: Option<u32>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<Option<String>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    /// No field changes.
    pub fn none() -> Self {
        Self::default()
    }

    /// Records a claim by `worker_id` at `at`.
    pub fn claim(worker_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            claimed_by: Some(Some(worker_id.into())),
            claimed_at: Some(Some(at)),
            ..Self::default()
        }
    }

    /// Clears the claim so the task can be queued again.
    pub fn release() -> Self {
        Self {
            claimed_by: Some(None),
            claimed_at: Some(None),
            ..Self::default()
        }
    }

    /// Stores a successful result.
    pub fn complete(result: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            result: Some(result),
            error_message: Some(None),
            completed_at: Some(at),
            ..Self::default()
        }
    }

    /// Records a terminal failure or cancellation.
    pub fn finish_with_error(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error_message: Some(Some(message.into())),
            completed_at: Some(at),
            ..Self::default()
        }
    }

    /// Sets the eligibility time.
    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }

    /// Sets the retry counter.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Sets the last error message.
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }
}

/// Outcome reported by a worker after executing a task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The executor returned a result payload.
    Succeeded(serde_json::Value),
    /// The executor failed; the retry manager decides what happens next.
    Failed(ExecutionError),
    /// The executor stopped because a cancellation was requested.
    Cancelled(String),
    /// The worker is shutting down and hands the task back untouched.
    Released(String),
}

impl TaskOutcome {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded(_) => "succeeded",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Cancelled(_) => "cancelled",
            TaskOutcome::Released(_) => "released",
        }
    }
}

/// What happened to a task after its outcome was reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Stored as `completed`.
    Completed,
    /// Re-queued for another attempt.
    Retried {
        retry_count: u32,
        run_after: DateTime<Utc>,
    },
    /// Parked in `failed`.
    DeadLettered,
    /// Stored as `cancelled`.
    Cancelled,
    /// Returned to the queue without consuming a retry.
    Released,
    /// The task no longer belonged to the reporting worker; the report was dropped.
    Lost,
}

impl Disposition {
    /// Terminal status the task reached, if any.
    pub fn terminal_status(&self) -> Option<TaskStatus> {
        match self {
            Disposition::Completed => Some(TaskStatus::Completed),
            Disposition::DeadLettered => Some(TaskStatus::Failed),
            Disposition::Cancelled => Some(TaskStatus::Cancelled),
            Disposition::Retried { .. } | Disposition::Released | Disposition::Lost => None,
        }
    }

    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Retried { .. } => "retried",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Cancelled => "cancelled",
            Disposition::Released => "released",
            Disposition::Lost => "lost",
        }
    }
}

/// Event type of an audit-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Created,
    Claimed,
    Started,
    Progress,
    Completed,
    Failed,
    Retried,
    Reclaimed,
    Cancelled,
    Released,
}

impl LogEvent {
    /// Returns the persisted string form.
    pub fn as_str(self) -> &'static str {
        match self {
            LogEvent::Created => "created",
            LogEvent::Claimed => "claimed",
            LogEvent::Started => "started",
            LogEvent::Progress => "progress",
            LogEvent::Completed => "completed",
            LogEvent::Failed => "failed",
            LogEvent::Retried => "retried",
            LogEvent::Reclaimed => "reclaimed",
            LogEvent::Cancelled => "cancelled",
            LogEvent::Released => "released",
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(LogEvent::Created),
            "claimed" => Ok(LogEvent::Claimed),
            "started" => Ok(LogEvent::Started),
            "progress" => Ok(LogEvent::Progress),
            "completed" => Ok(LogEvent::Completed),
            "failed" => Ok(LogEvent::Failed),
            "retried" => Ok(LogEvent::Retried),
            "reclaimed" => Ok(LogEvent::Reclaimed),
            "cancelled" => Ok(LogEvent::Cancelled),
            "released" => Ok(LogEvent::Released),
            other => Err(format!("unknown log event '{}'", other)),
        }
    }
}

/// Audit record to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub task_id: TaskId,
    pub worker_id: Option<String>,
    pub event: LogEvent,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl NewLogEntry {
    /// Creates an entry without worker or details.
    pub fn new(task_id: TaskId, event: LogEvent, message: impl Into<String>) -> Self {
        Self {
            task_id,
            worker_id: None,
            event,
            message: message.into(),
            details: None,
        }
    }

    /// Attributes the entry to a worker.
    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Persisted audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: TaskId,
    pub worker_id: Option<String>,
    pub event: LogEvent,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Coarse state a worker advertises in its heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopping,
}

impl WorkerStatus {
    /// Returns the persisted string form.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "busy" => Ok(WorkerStatus::Busy),
            "stopping" => Ok(WorkerStatus::Stopping),
            other => Err(format!("unknown worker status '{}'", other)),
        }
    }
}

/// Counters and references a worker reports with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatMetrics {
    pub processed_count: u64,
    pub failed_count: u64,
    pub current_task: Option<TaskId>,
    pub policy: Option<String>,
}

/// Persisted liveness record of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub processed_count: u64,
    pub failed_count: u64,
    /// Weak reference to the task the worker holds.
    pub current_task: Option<TaskId>,
    pub policy: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_strings() {
        for status in TaskStatus::ALL {
            let parsed: TaskStatus = status.as_str().parse().expect("should parse");
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Queued.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Queued));
        assert!(Claimed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in TaskStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_new_task_builder() {
        let at = Utc::now();
        let task = NewTask::new("scrape_video", serde_json::json!({"url": "https://x"}))
            .with_priority(7)
            .with_run_after(at)
            .with_max_retries(5);

        assert_eq!(task.task_type, "scrape_video");
        assert_eq!(task.priority, 7);
        assert_eq!(task.run_after, Some(at));
        assert_eq!(task.max_retries, Some(5));
    }

    #[test]
    fn test_new_task_defaults() {
        let task = NewTask::new("classify", serde_json::json!({}));
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert!(task.run_after.is_none());
        assert!(task.max_retries.is_none());
    }

    #[test]
    fn test_task_update_release_clears_claim() {
        let update = TaskUpdate::release();
        assert_eq!(update.claimed_by, Some(None));
        assert_eq!(update.claimed_at, Some(None));
        assert!(update.retry_count.is_none());
    }

    #[test]
    fn test_log_event_parse() {
        for event in [
            LogEvent::Created,
            LogEvent::Claimed,
            LogEvent::Started,
            LogEvent::Progress,
            LogEvent::Completed,
            LogEvent::Failed,
            LogEvent::Retried,
            LogEvent::Reclaimed,
            LogEvent::Cancelled,
            LogEvent::Released,
        ] {
            assert_eq!(event.as_str().parse::<LogEvent>(), Ok(event));
        }
    }

    #[test]
    fn test_task_id_parse_and_display() {
        let id: TaskId = " 42 ".parse().expect("should parse");
        assert_eq!(id, TaskId(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(TaskOutcome::Succeeded(serde_json::Value::Null).label(), "succeeded");
        assert_eq!(
            TaskOutcome::Failed(ExecutionError::network("reset")).label(),
            "failed"
        );
        assert_eq!(TaskOutcome::Released("shutdown".into()).label(), "released");
    }
}
