//! Demo task types run by `jobforge worker`.
//!
//! - `echo`: returns its message, optionally failing the first attempts
//! - `sleep`: sleeps in steps, reporting progress and honouring cancellation

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, FailureKind, ValidationError};
use crate::scheduler::{ExecutionContext, TaskKind, TaskRegistry, TypedExecutor};

/// Parameters of an `echo` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
    /// Number of attempts that fail with a network error before one succeeds.
    #[serde(default)]
    pub fail_attempts: u32,
}

impl TaskKind for Echo {
    const TYPE: &'static str = "echo";

    fn validate(&self) -> Result<(), String> {
        if self.message.len() > 4096 {
            return Err("message must be at most 4096 bytes".to_string());
        }
        Ok(())
    }
}

/// Parameters of a `sleep` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sleep {
    pub millis: u64,
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Fail after sleeping, with this failure kind.
    #[serde(default)]
    pub fail_with: Option<FailureKind>,
}

fn default_steps() -> u32 {
    1
}

impl TaskKind for Sleep {
    const TYPE: &'static str = "sleep";

    fn validate(&self) -> Result<(), String> {
        if self.steps == 0 {
            return Err("steps must be at least 1".to_string());
        }
        Ok(())
    }
}

pub struct EchoExecutor;

#[async_trait]
impl TypedExecutor<Echo> for EchoExecutor {
    async fn run(
        &self,
        params: Echo,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        ctx.checkpoint()?;
        let attempt = ctx.task().retry_count;
        if attempt < params.fail_attempts {
            return Err(ExecutionError::network(format!(
                "simulated failure on attempt {}",
                attempt + 1
            )));
        }
        Ok(serde_json::json!({
            "message": params.message,
            "worker": ctx.worker_id(),
        }))
    }
}

pub struct SleepExecutor;

#[async_trait]
impl TypedExecutor<Sleep> for SleepExecutor {
    async fn run(
        &self,
        params: Sleep,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let step = Duration::from_millis(params.millis / u64::from(params.steps));
        for i in 0..params.steps {
            tokio::select! {
                _ = tokio::time::sleep(step) => {}
                _ = ctx.cancelled() => return Err(ExecutionError::cancelled()),
            }
            ctx.progress(
                format!("step {}/{}", i + 1, params.steps),
                Some(serde_json::json!({ "step": i + 1, "of": params.steps })),
            )
            .await?;
        }
        if let Some(kind) = params.fail_with {
            return Err(ExecutionError::new(kind, "requested failure"));
        }
        Ok(serde_json::json!({ "slept_ms": params.millis }))
    }
}

/// Registry with the demo task types and their executors.
pub fn demo_registry() -> Result<TaskRegistry, ValidationError> {
    let mut registry = TaskRegistry::new();
    registry.register_with_executor::<Echo, _>(EchoExecutor)?;
    registry.register_with_executor::<Sleep, _>(SleepExecutor)?;
    Ok(registry)
}
