//! Worker pool running several worker runtimes in one process.
//!
//! The pool shares one claimer and one retry manager between its runtimes,
//! optionally runs a health monitor next to them, and propagates shutdown
//! through a parent cancellation token.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown: running tasks finish or are released back to the queue
//! - Recovery sweep on start for tasks left behind by a previous run
//! - Pool statistics aggregated from every runtime

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::QueueError;
use crate::storage::TaskStore;

use super::claimer::Claimer;
use super::config::QueueConfig;
use super::health::HealthMonitor;
use super::policy::SchedulingPolicy;
use super::retry::RetryManager;
use super::worker::{WorkerRuntime, WorkerStats};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently executing a task.
    pub active_workers: usize,
    /// Total number of tasks completed successfully.
    pub tasks_completed: u64,
    /// Total number of executions that failed.
    pub tasks_failed: u64,
    /// Total number of tasks handled, whatever the outcome.
    pub tasks_processed: u64,
}

impl PoolStats {
    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            return 0.0;
        }
        (self.tasks_completed as f64 / total as f64) * 100.0
    }
}

/// Pool of worker runtimes sharing one store.
pub struct WorkerPool {
    config: QueueConfig,
    store: TaskStore,
    claimer: Arc<Claimer>,
    retry: Arc<RetryManager>,
    policy: SchedulingPolicy,
    run_monitor: bool,
    shutdown: CancellationToken,
    workers: Vec<Arc<WorkerRuntime>>,
    handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool over `store`. Nothing runs until [`WorkerPool::start`].
    pub fn new(store: TaskStore, config: QueueConfig) -> Self {
        let claimer = Arc::new(Claimer::new(store.clone(), &config));
        let retry = Arc::new(RetryManager::new(
            store.clone(),
            config.retry_backoff.clone(),
        ));
        Self {
            policy: config.policy,
            config,
            store,
            claimer,
            retry,
            run_monitor: true,
            shutdown: CancellationToken::new(),
            workers: Vec::new(),
            handles: Vec::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Sets the policy used by every runtime.
    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Disables the in-process health monitor.
    pub fn without_monitor(mut self) -> Self {
        self.run_monitor = false;
        self
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        self.shutdown = CancellationToken::new();
        self.workers.clear();

        if self.run_monitor {
            let monitor = Arc::new(HealthMonitor::new(self.store.clone(), &self.config));

            // Recover tasks left behind by workers of a previous run
            match monitor.sweep().await {
                Ok(report) if report.recovered() > 0 => {
                    info!(recovered = report.recovered(), "Recovered tasks from dead workers");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Startup recovery sweep failed"),
            }

            let token = self.shutdown.child_token();
            self.handles.push(tokio::spawn(async move {
                monitor.run(token).await;
            }));
        }

        for _ in 0..self.config.worker_count {
            let runtime = Arc::new(
                WorkerRuntime::new(
                    self.store.clone(),
                    Arc::clone(&self.claimer),
                    Arc::clone(&self.retry),
                    &self.config,
                )
                .with_policy(self.policy),
            );
            let token = self.shutdown.child_token();
            let handle = tokio::spawn({
                let runtime = Arc::clone(&runtime);
                async move {
                    runtime.run(token).await;
                }
            });
            self.workers.push(runtime);
            self.handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            num_workers = self.config.worker_count,
            policy = %self.policy,
            monitor = self.run_monitor,
            "Worker pool started"
        );
        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout. Their tasks are then recovered by the next
    /// health sweep.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Runs until `signal` resolves, then shuts down.
    pub async fn run_until<F>(&mut self, signal: F) -> Result<PoolStats, PoolError>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        signal.await;
        self.shutdown().await?;
        Ok(self.stats())
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            num_workers: self.workers.len(),
            ..PoolStats::default()
        };
        for worker in &self.workers {
            let WorkerStats {
                processed,
                failed,
                completed,
                ..
            } = worker.stats();
            stats.tasks_processed += processed;
            stats.tasks_failed += failed;
            stats.tasks_completed += completed;
            if worker.current_task().is_some() {
                stats.active_workers += 1;
            }
        }
        stats
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers the pool starts.
    pub fn num_workers(&self) -> usize {
        self.config.worker_count
    }

    /// Identifiers of the started runtimes.
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.id().to_string()).collect()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }
}
