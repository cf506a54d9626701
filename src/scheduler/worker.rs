//! Worker runtime.
//!
//! A runtime repeatedly claims a task, executes it under a timeout and a
//! cancellation token, and reports the outcome. A separate heartbeat loop
//! refreshes the worker's liveness row and trips the token when an
//! operator requests cancellation of the task being executed.
//!
//! ```text
//! Idle -> Polling -> Claimed -> Executing -> Reporting -> Idle
//!                                  |
//!                                  v
//!                              Cancelling -> Reporting
//! ```
//!
//! On shutdown the runtime stops claiming, lets the current execution wind
//! down within the cancel grace window, hands an unfinished task back to
//! the queue and removes its heartbeat row.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::millis;
use crate::error::{ExecutionError, QueueError};
use crate::metrics::MetricsCollector;
use crate::storage::TaskStore;

use super::backoff::Backoff;
use super::claimer::Claimer;
use super::config::QueueConfig;
use super::executor::ExecutionContext;
use super::policy::SchedulingPolicy;
use super::retry::RetryManager;
use super::task::{
    Disposition, HeartbeatMetrics, LogEvent, NewLogEntry, Task, TaskId, TaskOutcome, TaskStatus,
    TaskUpdate, WorkerStatus,
};

/// Lifecycle state of a worker runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Claimed,
    Executing,
    Cancelling,
    Reporting,
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Polling => "polling",
            WorkerState::Claimed => "claimed",
            WorkerState::Executing => "executing",
            WorkerState::Cancelling => "cancelling",
            WorkerState::Reporting => "reporting",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing was claimable; poll again after `retry_in`.
    Empty { retry_in: Duration },
    /// A task was claimed and handled.
    Processed {
        task_id: TaskId,
        disposition: Disposition,
    },
}

/// Cumulative counters of one runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Tasks claimed and handled, whatever the outcome.
    pub processed: u64,
    /// Executions that ended in a failure (retried or dead-lettered).
    pub failed: u64,
    /// Tasks finished successfully.
    pub completed: u64,
    /// Reports dropped because the task had been reclaimed.
    pub lost: u64,
}

#[derive(Default)]
struct SharedWorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    completed: AtomicU64,
    lost: AtomicU64,
}

impl SharedWorkerStats {
    fn record(&self, disposition: &Disposition) {
        self.processed.fetch_add(1, Ordering::SeqCst);
        match disposition {
            Disposition::Completed => {
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
            Disposition::Retried { .. } | Disposition::DeadLettered => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
            Disposition::Lost => {
                self.lost.fetch_add(1, Ordering::SeqCst);
            }
            Disposition::Cancelled | Disposition::Released => {}
        }
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            lost: self.lost.load(Ordering::SeqCst),
        }
    }
}

/// The task being executed, as seen by the heartbeat loop.
#[derive(Clone)]
struct CurrentTask {
    id: TaskId,
    token: CancellationToken,
    cancel_requested: Arc<AtomicBool>,
}

/// Why an execution stopped before its executor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Timeout,
    Cancelled,
}

/// Generates a worker identifier unique across processes.
pub fn generate_worker_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("worker-{}", &uuid[..12])
}

/// A single worker: claims, executes and reports tasks until shut down.
pub struct WorkerRuntime {
    id: String,
    store: TaskStore,
    claimer: Arc<Claimer>,
    retry: Arc<RetryManager>,
    policy: SchedulingPolicy,
    task_types: Vec<String>,
    poll_backoff: Backoff,
    heartbeat_interval: Duration,
    task_timeout: Duration,
    cancel_grace: Duration,
    state: Mutex<WorkerState>,
    current: Mutex<Option<CurrentTask>>,
    stats: SharedWorkerStats,
    empty_polls: AtomicU32,
    rng: Mutex<ChaCha8Rng>,
    metrics: MetricsCollector,
}

impl WorkerRuntime {
    /// Creates a runtime that executes every type with a registered executor.
    pub fn new(
        store: TaskStore,
        claimer: Arc<Claimer>,
        retry: Arc<RetryManager>,
        config: &QueueConfig,
    ) -> Self {
        let task_types = store.registry().executable_types();
        Self {
            id: generate_worker_id(),
            store,
            claimer,
            retry,
            policy: config.policy,
            task_types,
            poll_backoff: config.poll_backoff.clone(),
            heartbeat_interval: config.heartbeat_interval,
            task_timeout: config.task_timeout,
            cancel_grace: config.cancel_grace,
            state: Mutex::new(WorkerState::Idle),
            current: Mutex::new(None),
            stats: SharedWorkerStats::default(),
            empty_polls: AtomicU32::new(0),
            rng: Mutex::new(ChaCha8Rng::from_rng(&mut rand::rng())),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restricts claiming to `task_types`.
    ///
    /// Types without an executor are dropped.
    pub fn with_task_types(mut self, task_types: Vec<String>) -> Self {
        let registry = self.store.registry();
        self.task_types = task_types
            .into_iter()
            .filter(|t| registry.executor(t).is_some())
            .collect();
        self
    }

    /// Makes poll jitter reproducible.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn policy(&self) -> SchedulingPolicy {
        self.policy
    }

    pub fn task_types(&self) -> &[String] {
        &self.task_types
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Task currently being executed, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.id)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn set_current(&self, current: Option<CurrentTask>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = current;
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Storage errors inside the loop are logged and retried after a
    /// backoff; they never stop the runtime.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> WorkerStats {
        info!(
            worker_id = %self.id,
            policy = %self.policy,
            task_types = ?self.task_types,
            "Worker started"
        );

        if let Err(e) = self.heartbeat().await {
            warn!(worker_id = %self.id, error = %e, "Initial heartbeat failed");
        }

        let heartbeat_stop = CancellationToken::new();
        let heartbeat_handle = tokio::spawn({
            let this = Arc::clone(&self);
            let stop = heartbeat_stop.clone();
            async move { this.heartbeat_loop(stop).await }
        });

        let mut consecutive_errors = 0u32;
        while !shutdown.is_cancelled() {
            match self.poll_once(&shutdown).await {
                Ok(PollOutcome::Empty { retry_in }) => {
                    consecutive_errors = 0;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(retry_in) => {}
                    }
                }
                Ok(PollOutcome::Processed { .. }) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = self.poll_backoff.base_delay(consecutive_errors);
                    error!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = millis(delay),
                        "Worker poll failed"
                    );
                    self.set_state(WorkerState::Idle);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(WorkerState::Stopped);
        heartbeat_stop.cancel();
        if let Err(e) = heartbeat_handle.await {
            error!(worker_id = %self.id, error = %e, "Heartbeat loop panicked");
        }
        if let Err(e) = self.store.remove_heartbeat(&self.id).await {
            warn!(worker_id = %self.id, error = %e, "Failed to remove heartbeat");
        }

        let stats = self.stats();
        info!(
            worker_id = %self.id,
            processed = stats.processed,
            failed = stats.failed,
            "Worker stopped"
        );
        stats
    }

    async fn heartbeat_loop(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately and run() already sent one.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(worker_id = %self.id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }

    /// Refreshes the heartbeat row and checks the current task for a
    /// cancellation request.
    pub async fn heartbeat(&self) -> Result<(), QueueError> {
        let current = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let status = match (self.state(), &current) {
            (WorkerState::Stopped, _) => WorkerStatus::Stopping,
            (_, Some(_)) => WorkerStatus::Busy,
            (_, None) => WorkerStatus::Idle,
        };
        let stats = self.stats();
        let metrics = HeartbeatMetrics {
            processed_count: stats.processed,
            failed_count: stats.failed,
            current_task: current.as_ref().map(|c| c.id),
            policy: Some(self.policy.as_str().to_string()),
        };
        self.store
            .record_heartbeat(&self.id, status, &metrics)
            .await?;

        if let Some(current) = current {
            if !current.token.is_cancelled() && self.store.is_cancel_requested(current.id).await? {
                info!(worker_id = %self.id, task_id = %current.id, "Cancellation requested, stopping task");
                current.cancel_requested.store(true, Ordering::SeqCst);
                current.token.cancel();
            }
        }
        Ok(())
    }

    /// Claims and handles at most one task.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<PollOutcome, QueueError> {
        self.set_state(WorkerState::Polling);
        let claimed = self
            .claimer
            .claim_next_of(&self.id, self.policy, Some(&self.task_types))
            .await?;

        let Some(task) = claimed else {
            let attempt = self.empty_polls.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            let retry_in = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                self.poll_backoff.delay(attempt, &mut rng)
            };
            self.set_state(WorkerState::Idle);
            return Ok(PollOutcome::Empty { retry_in });
        };

        self.empty_polls.store(0, Ordering::SeqCst);
        self.set_state(WorkerState::Claimed);
        let task_id = task.id;
        let result = self.process(task, shutdown).await;
        self.set_current(None);
        self.set_state(WorkerState::Idle);

        let disposition = result?;
        self.stats.record(&disposition);
        debug!(
            worker_id = %self.id,
            task_id = %task_id,
            disposition = disposition.label(),
            "Task handled"
        );
        Ok(PollOutcome::Processed {
            task_id,
            disposition,
        })
    }

    async fn process(&self, mut task: Task, shutdown: &CancellationToken) -> Result<Disposition, QueueError> {
        if task.cancel_requested {
            self.set_state(WorkerState::Reporting);
            return self
                .retry
                .report(&task, &self.id, TaskOutcome::Cancelled("cancellation requested".to_string()))
                .await;
        }

        let Some(executor) = self.store.registry().executor(&task.task_type) else {
            warn!(worker_id = %self.id, task_id = %task.id, task_type = %task.task_type, "No executor for task type");
            self.set_state(WorkerState::Reporting);
            return self
                .retry
                .report(&task, &self.id, TaskOutcome::Released("no executor in this worker".to_string()))
                .await;
        };

        let started = self
            .store
            .transition_owned(task.id, &self.id, TaskStatus::Claimed, TaskStatus::Running, TaskUpdate::none())
            .await?;
        if !started {
            warn!(worker_id = %self.id, task_id = %task.id, "Task was taken away before it started");
            return Ok(Disposition::Lost);
        }
        task.status = TaskStatus::Running;
        self.store
            .append_log(
                NewLogEntry::new(task.id, LogEvent::Started, format!("started by {}", self.id))
                    .with_worker(self.id.clone())
                    .with_details(serde_json::json!({ "attempt": task.retry_count + 1 })),
            )
            .await?;

        let token = shutdown.child_token();
        let cancel_requested = Arc::new(AtomicBool::new(false));
        self.set_current(Some(CurrentTask {
            id: task.id,
            token: token.clone(),
            cancel_requested: Arc::clone(&cancel_requested),
        }));
        self.set_state(WorkerState::Executing);
        info!(
            worker_id = %self.id,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.retry_count + 1,
            "Executing task"
        );

        let ctx = ExecutionContext::new(task.clone(), self.id.clone(), token.clone(), self.store.clone());
        let clock = Instant::now();
        self.metrics.task_started();

        let mut execution = AssertUnwindSafe(executor.execute(ctx)).catch_unwind();
        let interrupted = tokio::select! {
            res = &mut execution => Err(flatten_panic(res)),
            _ = tokio::time::sleep(self.task_timeout) => Ok(Interrupt::Timeout),
            _ = token.cancelled() => Ok(Interrupt::Cancelled),
        };
        let (result, interrupt) = match interrupted {
            Err(result) => (result, None),
            Ok(interrupt) => {
                self.set_state(WorkerState::Cancelling);
                token.cancel();
                debug!(worker_id = %self.id, task_id = %task.id, ?interrupt, "Waiting for executor to stop");
                let result = match tokio::time::timeout(self.cancel_grace, &mut execution).await {
                    Ok(res) => flatten_panic(res),
                    Err(_) => {
                        warn!(
                            worker_id = %self.id,
                            task_id = %task.id,
                            grace_ms = millis(self.cancel_grace),
                            "Executor ignored cancellation, abandoning it"
                        );
                        Err(ExecutionError::cancelled())
                    }
                };
                (result, Some(interrupt))
            }
        };
        drop(execution);

        let elapsed = clock.elapsed();
        self.metrics.task_finished();
        self.metrics
            .observe_duration(&task.task_type, elapsed.as_secs_f64());

        let outcome = self.outcome_for(
            result,
            interrupt,
            cancel_requested.load(Ordering::SeqCst),
            shutdown.is_cancelled(),
        );
        debug!(
            worker_id = %self.id,
            task_id = %task.id,
            outcome = outcome.label(),
            duration_ms = millis(elapsed),
            "Execution finished"
        );

        self.set_state(WorkerState::Reporting);
        self.retry.report(&task, &self.id, outcome).await
    }

    /// Chooses the reported outcome. Timeout beats an operator
    /// cancellation, which beats a shutdown.
    fn outcome_for(
        &self,
        result: Result<serde_json::Value, ExecutionError>,
        interrupt: Option<Interrupt>,
        cancel_requested: bool,
        shutting_down: bool,
    ) -> TaskOutcome {
        match result {
            Ok(value) => TaskOutcome::Succeeded(value),
            Err(_) if interrupt == Some(Interrupt::Timeout) => TaskOutcome::Failed(
                ExecutionError::timeout(format!(
                    "execution exceeded {}s",
                    self.task_timeout.as_secs_f64()
                )),
            ),
            Err(_) if cancel_requested => {
                TaskOutcome::Cancelled("cancellation requested".to_string())
            }
            Err(_) if shutting_down => TaskOutcome::Released("worker shutting down".to_string()),
            Err(e) => TaskOutcome::Failed(e),
        }
    }
}

fn flatten_panic(
    res: Result<Result<serde_json::Value, ExecutionError>, Box<dyn Any + Send>>,
) -> Result<serde_json::Value, ExecutionError> {
    res.unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(ExecutionError::logic(format!("executor panicked: {}", message)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::scheduler::executor::TaskExecutor;
    use crate::scheduler::registry::TaskRegistry;
    use crate::scheduler::task::NewTask;

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
            Ok(ctx.parameters().clone())
        }
    }

    struct Flaky;

    #[async_trait]
    impl TaskExecutor for Flaky {
        async fn execute(&self, _ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
            Err(ExecutionError::network("upstream unavailable"))
        }
    }

    /// Waits for cancellation and honours it.
    struct Patient;

    #[async_trait]
    impl TaskExecutor for Patient {
        async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
            ctx.cancelled().await;
            Err(ExecutionError::cancelled())
        }
    }

    struct Panicky;

    #[async_trait]
    impl TaskExecutor for Panicky {
        async fn execute(&self, _ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
            panic!("bad state");
        }
    }

    async fn setup(config: &QueueConfig) -> (TaskStore, WorkerRuntime) {
        let mut registry = TaskRegistry::new();
        for name in ["echo", "flaky", "patient", "panicky", "orphan"] {
            registry
                .register_dynamic(name, |_| Ok(()))
                .expect("register");
        }
        registry.set_executor("echo", Arc::new(Echo)).expect("executor");
        registry.set_executor("flaky", Arc::new(Flaky)).expect("executor");
        registry.set_executor("patient", Arc::new(Patient)).expect("executor");
        registry.set_executor("panicky", Arc::new(Panicky)).expect("executor");

        let store = TaskStore::in_memory(Arc::new(registry)).await.expect("store");
        store.run_migrations().await.expect("migrate");
        let claimer = Arc::new(Claimer::new(store.clone(), config));
        let retry = Arc::new(RetryManager::new(store.clone(), config.retry_backoff.clone()).with_seed(3));
        let worker = WorkerRuntime::new(store.clone(), claimer, retry, config)
            .with_id("w-test")
            .with_seed(3);
        (store, worker)
    }

    #[tokio::test]
    async fn test_poll_empty_backs_off() {
        let config = QueueConfig::default();
        let (_store, worker) = setup(&config).await;
        let shutdown = CancellationToken::new();

        let first = worker.poll_once(&shutdown).await.expect("poll");
        let second = worker.poll_once(&shutdown).await.expect("poll");
        let (PollOutcome::Empty { retry_in: a }, PollOutcome::Empty { retry_in: b }) = (first, second) else {
            panic!("expected empty polls");
        };
        assert!(a <= config.poll_backoff.max);
        assert!(b <= config.poll_backoff.max);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_only_executable_types_are_claimed() {
        let config = QueueConfig::default();
        let (store, worker) = setup(&config).await;
        assert!(!worker.task_types().contains(&"orphan".to_string()));

        store
            .enqueue(NewTask::new("orphan", serde_json::json!({})))
            .await
            .expect("enqueue");
        let outcome = worker.poll_once(&CancellationToken::new()).await.expect("poll");
        assert!(matches!(outcome, PollOutcome::Empty { .. }));
    }

    #[tokio::test]
    async fn test_successful_execution_completes() {
        let config = QueueConfig::default();
        let (store, worker) = setup(&config).await;
        let id = store
            .enqueue(NewTask::new("echo", serde_json::json!({"value": 42})))
            .await
            .expect("enqueue");

        let outcome = worker.poll_once(&CancellationToken::new()).await.expect("poll");
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                task_id: id,
                disposition: Disposition::Completed
            }
        );

        let task = store.get(id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(serde_json::json!({"value": 42})));

        let events: Vec<LogEvent> = store
            .list_logs(id)
            .await
            .expect("logs")
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![LogEvent::Created, LogEvent::Claimed, LogEvent::Started, LogEvent::Completed]
        );
        assert_eq!(worker.stats().processed, 1);
        assert_eq!(worker.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let config = QueueConfig::default();
        let (store, worker) = setup(&config).await;
        let id = store
            .enqueue(NewTask::new("flaky", serde_json::json!({})))
            .await
            .expect("enqueue");

        let outcome = worker.poll_once(&CancellationToken::new()).await.expect("poll");
        let PollOutcome::Processed { disposition, .. } = outcome else {
            panic!("expected a processed task");
        };
        assert!(matches!(disposition, Disposition::Retried { retry_count: 1, .. }));
        assert_eq!(store.get(id).await.expect("get").status, TaskStatus::Queued);
        assert_eq!(worker.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_timeout_fails_execution() {
        let config = QueueConfig::default()
            .with_task_timeout(Duration::from_millis(50))
            .with_cancel_grace(Duration::from_millis(200));
        let (store, worker) = setup(&config).await;
        let id = store
            .enqueue(NewTask::new("patient", serde_json::json!({})).with_max_retries(0))
            .await
            .expect("enqueue");

        let outcome = worker.poll_once(&CancellationToken::new()).await.expect("poll");
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                task_id: id,
                disposition: Disposition::DeadLettered
            }
        );
        let task = store.get(id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error_message
            .as_deref()
            .is_some_and(|m| m.starts_with("timeout")));
    }

    #[tokio::test]
    async fn test_shutdown_releases_running_task() {
        let config = QueueConfig::default().with_cancel_grace(Duration::from_millis(200));
        let (store, worker) = setup(&config).await;
        let id = store
            .enqueue(NewTask::new("patient", serde_json::json!({})))
            .await
            .expect("enqueue");

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = worker.poll_once(&shutdown).await.expect("poll");
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                task_id: id,
                disposition: Disposition::Released
            }
        );
        let task = store.get(id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_panicking_executor_is_dead_lettered() {
        let config = QueueConfig::default();
        let (store, worker) = setup(&config).await;
        let id = store
            .enqueue(NewTask::new("panicky", serde_json::json!({})))
            .await
            .expect("enqueue");

        let outcome = worker.poll_once(&CancellationToken::new()).await.expect("poll");
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                task_id: id,
                disposition: Disposition::DeadLettered
            }
        );
        let task = store.get(id).await.expect("get");
        assert!(task
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("bad state")));
    }

    #[tokio::test]
    async fn test_heartbeat_reports_idle_worker() {
        let config = QueueConfig::default();
        let (store, worker) = setup(&config).await;
        worker.heartbeat().await.expect("heartbeat");

        let row = store
            .get_heartbeat("w-test")
            .await
            .expect("get")
            .expect("row");
        assert_eq!(row.status, WorkerStatus::Idle);
        assert_eq!(row.policy.as_deref(), Some("fifo"));
        assert!(row.current_task.is_none());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_worker_id();
        let b = generate_worker_id();
        assert!(a.starts_with("worker-"));
        assert_ne!(a, b);
    }
}
