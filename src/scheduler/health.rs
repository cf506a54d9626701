//! Heartbeat-based failure detection and task reclamation.
//!
//! A worker whose heartbeat is older than the TTL is presumed dead. Each
//! sweep returns the tasks it held to the queue and deletes the stale
//! heartbeat row. The interrupted attempt counts against the retry ceiling
//! but never pushes `retry_count` past it, so a reclaimed task is always
//! claimable again. A second pass picks up held tasks whose owner has no
//! heartbeat row at all.
//!
//! Reclamation uses the same owner-guarded compare-and-swap as reporting,
//! so a worker that was merely slow loses its late report instead of
//! clobbering the new state.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::earlier_by;
use crate::error::QueueError;
use crate::metrics::MetricsCollector;
use crate::storage::TaskStore;

use super::config::QueueConfig;
use super::task::{LogEvent, NewLogEntry, Task, TaskId, TaskStatus, TaskUpdate};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// Workers whose heartbeat had expired.
    pub stale_workers: Vec<String>,
    /// Tasks returned to the queue.
    pub reclaimed: Vec<TaskId>,
    /// Tasks cancelled because cancellation had been requested.
    pub cancelled: Vec<TaskId>,
    /// Tasks that changed hands before the sweep could act.
    pub skipped: usize,
}

impl SweepReport {
    /// Total number of tasks taken back from dead workers.
    pub fn recovered(&self) -> usize {
        self.reclaimed.len() + self.cancelled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stale_workers.is_empty() && self.recovered() == 0 && self.skipped == 0
    }
}

/// Retry counter after a reclaim: one more attempt, capped at the ceiling.
fn reclaimed_retry_count(task: &Task) -> u32 {
    task.retry_count.saturating_add(1).min(task.max_retries.max(task.retry_count))
}

/// Detects dead workers and recovers their tasks.
pub struct HealthMonitor {
    store: TaskStore,
    ttl: Duration,
    interval: Duration,
    metrics: MetricsCollector,
}

impl HealthMonitor {
    pub fn new(store: TaskStore, config: &QueueConfig) -> Self {
        Self {
            store,
            ttl: config.heartbeat_ttl,
            interval: config.sweep_interval,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Runs one detection and reclamation pass.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        let mut report = SweepReport::default();

        for heartbeat in self.store.list_stale_heartbeats(self.ttl).await? {
            let worker_id = heartbeat.worker_id;
            warn!(
                worker_id = %worker_id,
                last_heartbeat = %heartbeat.last_heartbeat,
                ttl_secs = self.ttl.as_secs(),
                "Worker heartbeat expired"
            );

            for task in self.store.list_claims_by_worker(&worker_id).await? {
                self.reclaim(&task, &worker_id, "worker heartbeat expired", &mut report)
                    .await?;
            }

            // Skip the delete if the worker came back since we looked.
            if self
                .store
                .remove_heartbeat_if_unchanged(&worker_id, heartbeat.last_heartbeat)
                .await?
            {
                report.stale_workers.push(worker_id);
            } else {
                debug!(worker_id = %worker_id, "Worker heartbeat refreshed during sweep");
            }
        }

        let cutoff = earlier_by(self.store.now(), self.ttl);
        for task in self.store.list_orphaned_claims(cutoff).await? {
            let Some(owner) = task.claimed_by.clone() else {
                continue;
            };
            self.reclaim(&task, &owner, "owner has no heartbeat", &mut report)
                .await?;
        }

        self.metrics.record_reclaimed(report.recovered());
        if !report.is_empty() {
            info!(
                stale_workers = report.stale_workers.len(),
                reclaimed = report.reclaimed.len(),
                cancelled = report.cancelled.len(),
                skipped = report.skipped,
                "Health sweep recovered tasks"
            );
        }
        Ok(report)
    }

    async fn reclaim(
        &self,
        task: &Task,
        owner: &str,
        reason: &str,
        report: &mut SweepReport,
    ) -> Result<(), QueueError> {
        let now = self.store.now();

        let retry_count = reclaimed_retry_count(task);
        let (target, update, event, message) = if task.cancel_requested {
            (
                TaskStatus::Cancelled,
                TaskUpdate::finish_with_error(format!("{}; cancellation requested", reason), now),
                LogEvent::Cancelled,
                format!("{}; cancellation requested", reason),
            )
        } else {
            (
                TaskStatus::Queued,
                TaskUpdate::none()
                    .with_retry_count(retry_count)
                    .with_error(reason.to_string()),
                LogEvent::Reclaimed,
                format!("{}; reclaimed from {}", reason, owner),
            )
        };

        let swapped = self
            .store
            .transition_owned(task.id, owner, task.status, target, update)
            .await?;
        if !swapped {
            debug!(task_id = %task.id, worker_id = owner, "Task moved on before reclamation");
            report.skipped += 1;
            return Ok(());
        }

        self.store
            .append_log(
                NewLogEntry::new(task.id, event, message)
                    .with_worker(owner)
                    .with_details(serde_json::json!({
                        "previous_status": task.status,
                        "retry_count": retry_count,
                        "max_retries": task.max_retries,
                    })),
            )
            .await?;

        if target == TaskStatus::Cancelled {
            self.metrics
                .record_finished(&task.task_type, TaskStatus::Cancelled);
            info!(task_id = %task.id, worker_id = owner, "Task cancelled during reclamation");
            report.cancelled.push(task.id);
        } else {
            info!(
                task_id = %task.id,
                worker_id = owner,
                retry_count,
                max_retries = task.max_retries,
                "Task reclaimed"
            );
            report.reclaimed.push(task.id);
        }
        Ok(())
    }

    /// Refreshes the queue-depth and active-worker gauges.
    pub async fn refresh_gauges(&self) -> Result<(), QueueError> {
        let views = self.store.views();
        for (status, count) in views.depth_by_status().await? {
            self.metrics.set_queue_depth(status, count);
        }
        self.metrics
            .set_active_workers(views.active_worker_count(self.ttl).await?);
        Ok(())
    }

    /// Sweeps every `sweep_interval` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            ttl_secs = self.ttl.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Health monitor started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Health sweep failed");
                    }
                    if let Err(e) = self.refresh_gauges().await {
                        warn!(error = %e, "Failed to refresh queue gauges");
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }
}
