//! Task queue facade.
//!
//! `TaskQueue` bundles a [`TaskStore`] with the components that act on it
//! and exposes the external interface of the system:
//!
//! - Submission: [`TaskQueue::enqueue`], [`TaskQueue::enqueue_batch`]
//! - Query: [`TaskQueue::get_task`], [`TaskQueue::list_tasks`], [`TaskQueue::task_logs`]
//! - Workers: [`TaskQueue::heartbeat`], [`TaskQueue::claim_next`],
//!   [`TaskQueue::start_task`], [`TaskQueue::report_result`]
//! - Operations: [`TaskQueue::cancel`], [`TaskQueue::sweep`]
//!
//! In-process workers use [`TaskQueue::worker_pool`] instead of driving the
//! claim/report calls by hand.
//!
//! # Reliability
//!
//! All state lives in the store. A claim is a compare-and-swap on the task
//! status; a crashed worker's tasks come back through the health monitor
//! once its heartbeat goes stale.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::QueueError;
use crate::storage::{CancelOutcome, QueueViews, TaskFilter, TaskStore};

use super::claimer::Claimer;
use super::config::QueueConfig;
use super::health::{HealthMonitor, SweepReport};
use super::policy::SchedulingPolicy;
use super::registry::TaskRegistry;
use super::retry::RetryManager;
use super::task::{
    Disposition, HeartbeatMetrics, LogEvent, NewLogEntry, NewTask, Task, TaskId, TaskLogEntry,
    TaskOutcome, TaskStatus, TaskUpdate, WorkerStatus,
};
use super::worker::WorkerRuntime;
use super::worker_pool::WorkerPool;

/// Durable task queue.
pub struct TaskQueue {
    store: TaskStore,
    config: QueueConfig,
    claimer: Arc<Claimer>,
    retry: Arc<RetryManager>,
    monitor: Arc<HealthMonitor>,
}

impl TaskQueue {
    /// Validates `config`, opens the database and applies migrations.
    ///
    /// # Errors
    ///
    /// `Config` for an invalid configuration, `Storage` if the database
    /// cannot be opened or migrated.
    pub async fn open(config: QueueConfig, registry: Arc<TaskRegistry>) -> Result<Self, QueueError> {
        config.validate()?;
        let store = TaskStore::connect(&config.database_url, config.max_connections, registry)
            .await?
            .with_default_max_retries(config.default_max_retries);
        let applied = store.run_migrations().await?;
        if applied > 0 {
            info!(applied, "Applied database migrations");
        }
        Ok(Self::with_store(store, config))
    }

    /// Builds a queue over an already migrated store.
    pub fn with_store(store: TaskStore, config: QueueConfig) -> Self {
        let claimer = Arc::new(Claimer::new(store.clone(), &config));
        let retry = Arc::new(RetryManager::new(
            store.clone(),
            config.retry_backoff.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(store.clone(), &config));
        Self {
            store,
            config,
            claimer,
            retry,
            monitor,
        }
    }

    /// Seeds the claimer and retry manager for reproducible runs.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.claimer = Arc::new(Claimer::new(self.store.clone(), &self.config).with_seed(seed));
        self.retry = Arc::new(
            RetryManager::new(self.store.clone(), self.config.retry_backoff.clone())
                .with_seed(seed.wrapping_add(1)),
        );
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn views(&self) -> QueueViews {
        self.store.views()
    }

    pub fn health_monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.monitor)
    }

    // =========================================================================
    // Submission and query
    // =========================================================================

    /// Submits a task. Fails only on validation or storage errors.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskId, QueueError> {
        self.store.enqueue(task).await
    }

    /// Submits several tasks atomically.
    pub async fn enqueue_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskId>, QueueError> {
        self.store.enqueue_batch(tasks).await
    }

    pub async fn get_task(&self, id: TaskId) -> Result<Task, QueueError> {
        self.store.get(id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, QueueError> {
        Ok(self.store.list_by_filter(filter).await?)
    }

    pub async fn task_logs(&self, id: TaskId) -> Result<Vec<TaskLogEntry>, QueueError> {
        Ok(self.store.list_logs(id).await?)
    }

    // =========================================================================
    // Worker protocol
    // =========================================================================

    /// Registers or refreshes a worker.
    pub async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        metrics: &HeartbeatMetrics,
    ) -> Result<(), QueueError> {
        Ok(self
            .store
            .record_heartbeat(worker_id, status, metrics)
            .await?)
    }

    /// Claims the next task under `policy`, or `None` if nothing is claimable.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        policy: SchedulingPolicy,
    ) -> Result<Option<Task>, QueueError> {
        self.claimer.claim_next(worker_id, policy).await
    }

    /// Moves a claimed task to `running`.
    ///
    /// Returns `None` if the task no longer belongs to `worker_id`.
    pub async fn start_task(&self, id: TaskId, worker_id: &str) -> Result<Option<Task>, QueueError> {
        let started = self
            .store
            .transition_owned(id, worker_id, TaskStatus::Claimed, TaskStatus::Running, TaskUpdate::none())
            .await?;
        if !started {
            return Ok(None);
        }
        self.store
            .append_log(
                NewLogEntry::new(id, LogEvent::Started, format!("started by {}", worker_id))
                    .with_worker(worker_id),
            )
            .await?;
        Ok(Some(self.store.get(id).await?))
    }

    /// Reports the outcome of a task held by `worker_id`.
    ///
    /// A report for a task the worker no longer holds is dropped and
    /// returns [`Disposition::Lost`].
    pub async fn report_result(
        &self,
        id: TaskId,
        worker_id: &str,
        outcome: TaskOutcome,
    ) -> Result<Disposition, QueueError> {
        let task = self.store.get(id).await?;
        if !task.status.is_held() || task.claimed_by.as_deref() != Some(worker_id) {
            warn!(
                task_id = %id,
                worker_id,
                status = %task.status,
                owner = ?task.claimed_by,
                "Report for a task this worker does not hold"
            );
            return Ok(Disposition::Lost);
        }
        self.retry.report(&task, worker_id, outcome).await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Requests cancellation of a task.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, QueueError> {
        self.store.request_cancel(id).await
    }

    /// Runs one health sweep.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        self.monitor.sweep().await
    }

    /// Creates a single worker runtime sharing this queue's claimer and retry manager.
    pub fn worker(&self) -> WorkerRuntime {
        WorkerRuntime::new(
            self.store.clone(),
            Arc::clone(&self.claimer),
            Arc::clone(&self.retry),
            &self.config,
        )
    }

    /// Creates a worker pool over this queue's store.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(self.store.clone(), self.config.clone())
    }
}
