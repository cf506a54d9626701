//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use jobforge::clock::ManualClock;
use jobforge::scheduler::{ExecutionContext, TaskExecutor, TaskRegistry};
use jobforge::{ExecutionError, TaskStore};
use tempfile::TempDir;

/// Returns its parameters.
pub struct Echo;

#[async_trait]
impl TaskExecutor for Echo {
    async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
        Ok(ctx.parameters().clone())
    }
}

/// Always fails with a transient error.
pub struct Flaky;

#[async_trait]
impl TaskExecutor for Flaky {
    async fn execute(&self, _ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
        Err(ExecutionError::network("connection reset"))
    }
}

/// Runs until cancelled.
pub struct Patient;

#[async_trait]
impl TaskExecutor for Patient {
    async fn execute(&self, ctx: ExecutionContext) -> Result<serde_json::Value, ExecutionError> {
        ctx.cancelled().await;
        Err(ExecutionError::cancelled())
    }
}

pub fn registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for name in ["echo", "flaky", "patient"] {
        registry
            .register_dynamic(name, |_| Ok(()))
            .expect("register");
    }
    registry.set_executor("echo", Arc::new(Echo)).expect("executor");
    registry.set_executor("flaky", Arc::new(Flaky)).expect("executor");
    registry
        .set_executor("patient", Arc::new(Patient))
        .expect("executor");
    registry
}

pub fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("queue.db").display())
}

/// Opens a migrated file-backed store in `dir`.
pub async fn file_store(dir: &TempDir) -> TaskStore {
    let store = TaskStore::connect(&database_url(dir), 8, Arc::new(registry()))
        .await
        .expect("connect");
    store.run_migrations().await.expect("migrate");
    store
}

/// Same as [`file_store`], reading time from a manual clock.
pub async fn file_store_with_clock(dir: &TempDir) -> (TaskStore, ManualClock) {
    let clock = ManualClock::starting_now();
    let store = file_store(dir).await.with_clock(Arc::new(clock.clone()));
    (store, clock)
}
