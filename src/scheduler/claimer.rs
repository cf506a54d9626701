//! Atomic task claiming.
//!
//! A claim picks up to `lookahead` candidates from the eligible set, ranked
//! by the worker's scheduling policy, and tries a `queued -> claimed`
//! compare-and-swap on each in turn. The first swap that lands wins; a lost
//! race moves on to the next candidate. At most one worker can ever hold a
//! task because the swap is a single conditional `UPDATE`.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::storage::TaskStore;

use super::config::QueueConfig;
use super::policy::{weighted_sample, SchedulingPolicy};
use super::task::{LogEvent, NewLogEntry, Task, TaskId, TaskStatus, TaskUpdate};

/// Claims tasks on behalf of workers.
pub struct Claimer {
    store: TaskStore,
    lookahead: usize,
    rng: Mutex<ChaCha8Rng>,
    metrics: MetricsCollector,
}

impl Claimer {
    /// Creates a claimer using the lookahead and sample size from `config`.
    pub fn new(store: TaskStore, config: &QueueConfig) -> Self {
        Self {
            store,
            lookahead: config.claim_lookahead.max(1),
            rng: Mutex::new(ChaCha8Rng::from_rng(&mut rand::rng())),
            metrics: MetricsCollector::new(),
        }
    }

    /// Makes weighted-random selection reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn with_lookahead(mut self, lookahead: usize) -> Self {
        self.lookahead = lookahead.max(1);
        self
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Claims the next eligible task of any type for `worker_id`.
    ///
    /// Returns `Ok(None)` when nothing is eligible or every candidate was
    /// taken by a concurrent claimer.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        policy: SchedulingPolicy,
    ) -> Result<Option<Task>, QueueError> {
        self.claim_next_of(worker_id, policy, None).await
    }

    /// Claims the next eligible task restricted to `task_types`.
    pub async fn claim_next_of(
        &self,
        worker_id: &str,
        policy: SchedulingPolicy,
        task_types: Option<&[String]>,
    ) -> Result<Option<Task>, QueueError> {
        let started = Instant::now();
        let now = self.store.now();

        let candidates: Vec<TaskId> = if policy.is_randomized() {
            let weights = self.store.eligible_weights(now, task_types).await?;
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            weighted_sample(
                weights.into_iter().map(|(id, priority)| (priority, id)),
                self.lookahead,
                &mut rng,
            )
        } else {
            self.store
                .eligible_tasks(now, policy, self.lookahead, task_types)
                .await?
                .into_iter()
                .map(|task| task.id)
                .collect()
        };
        if candidates.is_empty() {
            self.metrics
                .record_claim(started.elapsed().as_secs_f64(), 0);
            trace!(worker_id, policy = %policy, "No eligible tasks");
            return Ok(None);
        }

        let mut conflicts = 0u64;
        for candidate in candidates {
            match self.try_claim(candidate, worker_id, now).await {
                Ok(task) => {
                    self.metrics
                        .record_claim(started.elapsed().as_secs_f64(), conflicts);
                    debug!(
                        worker_id,
                        task_id = %task.id,
                        task_type = %task.task_type,
                        priority = task.priority,
                        policy = %policy,
                        conflicts,
                        "Task claimed"
                    );
                    return Ok(Some(task));
                }
                Err(QueueError::ClaimConflict { task_id }) => {
                    conflicts += 1;
                    debug!(worker_id, task_id = %task_id, "Lost claim race, trying next candidate");
                }
                Err(e) => return Err(e),
            }
        }

        self.metrics
            .record_claim(started.elapsed().as_secs_f64(), conflicts);
        debug!(worker_id, conflicts, "Every candidate was taken");
        Ok(None)
    }

    async fn try_claim(
        &self,
        id: TaskId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, QueueError> {
        let swapped = self
            .store
            .transition(
                id,
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskUpdate::claim(worker_id, now),
            )
            .await?;
        if !swapped {
            return Err(QueueError::ClaimConflict { task_id: id });
        }

        let task = self.store.get(id).await?;
        self.store
            .append_log(
                NewLogEntry::new(id, LogEvent::Claimed, format!("claimed by {}", worker_id))
                    .with_worker(worker_id)
                    .with_details(serde_json::json!({ "attempt": task.retry_count + 1 })),
            )
            .await?;
        Ok(task)
    }
}
