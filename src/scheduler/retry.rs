//! Outcome handling and retry decisions.
//!
//! Every report is applied with an owner-guarded compare-and-swap, so a
//! worker whose task was reclaimed in the meantime cannot overwrite the new
//! owner's state. Its report is dropped and surfaces as
//! [`Disposition::Lost`].

use std::sync::Mutex;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{error, info, warn};

use crate::clock::{later_by, millis};
use crate::error::{ExecutionError, QueueError};
use crate::metrics::MetricsCollector;
use crate::storage::TaskStore;

use super::backoff::Backoff;
use super::registry::FailureClass;
use super::task::{
    Disposition, LogEvent, NewLogEntry, Task, TaskOutcome, TaskStatus, TaskUpdate,
};

/// Applies execution outcomes to the store.
pub struct RetryManager {
    store: TaskStore,
    backoff: Backoff,
    rng: Mutex<ChaCha8Rng>,
    metrics: MetricsCollector,
}

impl RetryManager {
    pub fn new(store: TaskStore, backoff: Backoff) -> Self {
        Self {
            store,
            backoff,
            rng: Mutex::new(ChaCha8Rng::from_rng(&mut rand::rng())),
            metrics: MetricsCollector::new(),
        }
    }

    /// Makes retry jitter reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Records the outcome of `task`, which `worker_id` holds in `task.status`.
    ///
    /// # Errors
    ///
    /// Storage failures, or `InvalidTransition` when the outcome cannot
    /// follow the held status (e.g. success reported for a task that never
    /// started).
    pub async fn report(
        &self,
        task: &Task,
        worker_id: &str,
        outcome: TaskOutcome,
    ) -> Result<Disposition, QueueError> {
        match outcome {
            TaskOutcome::Succeeded(result) => self.complete(task, worker_id, result).await,
            TaskOutcome::Failed(err) => self.fail(task, worker_id, err).await,
            TaskOutcome::Cancelled(reason) => self.cancel(task, worker_id, reason).await,
            TaskOutcome::Released(reason) => self.release(task, worker_id, reason).await,
        }
    }

    async fn complete(
        &self,
        task: &Task,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Disposition, QueueError> {
        let now = self.store.now();
        let swapped = self
            .store
            .transition_owned(
                task.id,
                worker_id,
                task.status,
                TaskStatus::Completed,
                TaskUpdate::complete(result, now),
            )
            .await?;
        if !swapped {
            return Ok(self.lost(task, worker_id, "succeeded"));
        }

        self.store
            .append_log(
                NewLogEntry::new(task.id, LogEvent::Completed, "completed").with_worker(worker_id),
            )
            .await?;
        self.metrics
            .record_finished(&task.task_type, TaskStatus::Completed);
        info!(task_id = %task.id, worker_id, task_type = %task.task_type, "Task completed");
        Ok(Disposition::Completed)
    }

    async fn fail(
        &self,
        task: &Task,
        worker_id: &str,
        err: ExecutionError,
    ) -> Result<Disposition, QueueError> {
        let class = self.store.registry().classify(&task.task_type, &err);
        if class == FailureClass::Transient && task.can_retry() {
            self.retry(task, worker_id, &err).await
        } else {
            let reason = match class {
                FailureClass::Permanent => "permanent failure",
                FailureClass::Transient => "retries exhausted",
            };
            self.dead_letter(task, worker_id, &err, class, reason).await
        }
    }

    async fn retry(
        &self,
        task: &Task,
        worker_id: &str,
        err: &ExecutionError,
    ) -> Result<Disposition, QueueError> {
        let attempt = task.retry_count + 1;
        let delay = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            self.backoff.delay(attempt, &mut rng)
        };
        let run_after = later_by(self.store.now(), delay);

        let update = TaskUpdate::none()
            .with_retry_count(attempt)
            .with_run_after(run_after)
            .with_error(err.to_string());
        let swapped = self
            .store
            .transition_owned(task.id, worker_id, task.status, TaskStatus::Queued, update)
            .await?;
        if !swapped {
            return self.requeue_refused(task, worker_id, "failed").await;
        }

        let mut details = serde_json::json!({
            "retry_count": attempt,
            "max_retries": task.max_retries,
            "delay_ms": millis(delay),
            "kind": err.kind,
        });
        if let Some(detail) = &err.detail {
            details["detail"] = detail.clone();
        }
        self.store
            .append_log(
                NewLogEntry::new(task.id, LogEvent::Retried, err.to_string())
                    .with_worker(worker_id)
                    .with_details(details),
            )
            .await?;

        self.metrics.record_retry(&task.task_type);
        warn!(
            task_id = %task.id,
            worker_id,
            error = %err,
            retry_count = attempt,
            max_retries = task.max_retries,
            delay_ms = millis(delay),
            "Task failed, scheduled for retry"
        );
        Ok(Disposition::Retried {
            retry_count: attempt,
            run_after,
        })
    }

    async fn dead_letter(
        &self,
        task: &Task,
        worker_id: &str,
        err: &ExecutionError,
        class: FailureClass,
        reason: &str,
    ) -> Result<Disposition, QueueError> {
        let now = self.store.now();
        let swapped = self
            .store
            .transition_owned(
                task.id,
                worker_id,
                task.status,
                TaskStatus::Failed,
                TaskUpdate::finish_with_error(err.to_string(), now),
            )
            .await?;
        if !swapped {
            return Ok(self.lost(task, worker_id, "failed"));
        }

        let mut details = serde_json::json!({
            "class": class.to_string(),
            "kind": err.kind,
            "retry_count": task.retry_count,
            "max_retries": task.max_retries,
            "reason": reason,
        });
        if let Some(detail) = &err.detail {
            details["detail"] = detail.clone();
        }
        self.store
            .append_log(
                NewLogEntry::new(task.id, LogEvent::Failed, err.to_string())
                    .with_worker(worker_id)
                    .with_details(details),
            )
            .await?;

        self.metrics.record_finished(&task.task_type, TaskStatus::Failed);
        error!(
            task_id = %task.id,
            worker_id,
            error = %err,
            class = %class,
            reason,
            "Task moved to dead letter"
        );
        Ok(Disposition::DeadLettered)
    }

    async fn cancel(
        &self,
        task: &Task,
        worker_id: &str,
        reason: String,
    ) -> Result<Disposition, QueueError> {
        let now = self.store.now();
        let swapped = self
            .store
            .transition_owned(
                task.id,
                worker_id,
                task.status,
                TaskStatus::Cancelled,
                TaskUpdate::finish_with_error(reason.clone(), now),
            )
            .await?;
        if !swapped {
            return Ok(self.lost(task, worker_id, "cancelled"));
        }

        self.store
            .append_log(NewLogEntry::new(task.id, LogEvent::Cancelled, reason).with_worker(worker_id))
            .await?;
        self.metrics
            .record_finished(&task.task_type, TaskStatus::Cancelled);
        info!(task_id = %task.id, worker_id, "Task cancelled");
        Ok(Disposition::Cancelled)
    }

    async fn release(
        &self,
        task: &Task,
        worker_id: &str,
        reason: String,
    ) -> Result<Disposition, QueueError> {
        let swapped = self
            .store
            .transition_owned(
                task.id,
                worker_id,
                task.status,
                TaskStatus::Queued,
                TaskUpdate::release(),
            )
            .await?;
        if !swapped {
            return self.requeue_refused(task, worker_id, "released").await;
        }

        self.store
            .append_log(NewLogEntry::new(task.id, LogEvent::Released, reason).with_worker(worker_id))
            .await?;
        info!(task_id = %task.id, worker_id, "Task released back to the queue");
        Ok(Disposition::Released)
    }

    /// Resolves a requeue whose swap did not land. The store refuses to
    /// requeue a task with a pending cancel, and that cancel wins over the
    /// retry or release. Anything else means the task changed hands.
    async fn requeue_refused(
        &self,
        task: &Task,
        worker_id: &str,
        outcome: &str,
    ) -> Result<Disposition, QueueError> {
        let current = self.store.find(task.id).await?;
        let still_held = current.as_ref().is_some_and(|t| {
            t.status == task.status && t.claimed_by.as_deref() == Some(worker_id)
        });
        match current {
            Some(t) if still_held && t.cancel_requested => {
                info!(
                    task_id = %task.id,
                    worker_id,
                    outcome,
                    "Cancellation requested before requeue, cancelling instead"
                );
                self.cancel(task, worker_id, "cancellation requested".to_string())
                    .await
            }
            _ => Ok(self.lost(task, worker_id, outcome)),
        }
    }

    fn lost(&self, task: &Task, worker_id: &str, outcome: &str) -> Disposition {
        warn!(
            task_id = %task.id,
            worker_id,
            outcome,
            "Task is no longer held by this worker, dropping report"
        );
        Disposition::Lost
    }
}
