//! Executor seam between the worker runtime and job bodies.
//!
//! Job bodies implement [`TaskExecutor`]. The runtime hands each execution
//! an [`ExecutionContext`] carrying the task, a cancellation token and a
//! handle for progress events. Executors are expected to call
//! [`ExecutionContext::checkpoint`] between units of work; an executor that
//! ignores cancellation is abandoned after the grace window.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{ExecutionError, StorageError};
use crate::storage::TaskStore;

use super::registry::TaskKind;
use super::task::{LogEvent, NewLogEntry, Task};

/// A job body.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs the task and returns its result payload.
    async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError>;
}

/// Executor for one typed task kind.
#[async_trait]
pub trait TypedExecutor<K: TaskKind>: Send + Sync {
    async fn run(&self, params: K, ctx: &ExecutionContext)
        -> Result<serde_json::Value, ExecutionError>;
}

/// Adapts a [`TypedExecutor`] to the untyped [`TaskExecutor`] seam.
pub struct Typed<K: TaskKind, E: TypedExecutor<K>> {
    inner: E,
    _marker: PhantomData<fn() -> K>,
}

impl<K: TaskKind, E: TypedExecutor<K>> Typed<K, E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K: TaskKind, E: TypedExecutor<K>> TaskExecutor for Typed<K, E> {
    async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
        let params: K = ctx.params()?;
        self.inner.run(params, &ctx).await
    }
}

/// Everything an executor may touch while it runs.
#[derive(Clone)]
pub struct ExecutionContext {
    task: Task,
    worker_id: String,
    cancel: CancellationToken,
    store: TaskStore,
}

impl ExecutionContext {
    pub fn new(task: Task, worker_id: impl Into<String>, cancel: CancellationToken, store: TaskStore) -> Self {
        Self {
            task,
            worker_id: worker_id.into(),
            cancel,
            store,
        }
    }

    /// The task being executed.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Raw parameters.
    pub fn parameters(&self) -> &serde_json::Value {
        &self.task.parameters
    }

    /// Decodes the parameters into a typed value.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ExecutionError> {
        serde_json::from_value(self.task.parameters.clone())
            .map_err(|e| ExecutionError::invalid_input(format!("could not decode parameters: {}", e)))
    }

    /// The executing worker.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Token tripped on cancellation request, timeout or shutdown.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns `Err(cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Appends a `progress` entry to the task log.
    ///
    /// A storage failure is returned to the executor. `?` turns it into a
    /// transient [`ExecutionError`].
    pub async fn progress(
        &self,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<(), StorageError> {
        let mut entry = NewLogEntry::new(self.task.id, LogEvent::Progress, message)
            .with_worker(self.worker_id.clone());
        if let Some(details) = details {
            entry = entry.with_details(details);
        }
        self.store.append_log(entry).await.inspect_err(|e| {
            warn!(task_id = %self.task.id, error = %e, "Failed to record progress");
        })?;
        Ok(())
    }
}
