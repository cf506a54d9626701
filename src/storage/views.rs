//! Read-only aggregates for monitoring.
//!
//! Backed by the `v_*` views created by the migrations, plus a few
//! queries that need a time parameter (active workers, throughput, wait
//! times).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::clock::{earlier_by, SharedClock};
use crate::error::StorageError;
use crate::scheduler::fairness::FairnessReport;
use crate::scheduler::task::TaskStatus;

use super::database::to_millis;
use super::schema::tables;

/// Task count for one (status, type) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueDepth {
    pub status: TaskStatus,
    pub task_type: String,
    pub count: i64,
}

/// Retry and failure rates of one task type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeRates {
    pub task_type: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total_retries: i64,
    /// failed / (completed + failed)
    pub failure_rate: f64,
    /// Share of tasks that needed at least one retry.
    pub retry_rate: f64,
}

/// Completions over a trailing window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Throughput {
    pub window_secs: u64,
    pub completed: i64,
    pub failed: i64,
    pub per_minute: f64,
}

/// Everything `jobforge stats` prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub depth_by_status: BTreeMap<String, i64>,
    pub depth: Vec<QueueDepth>,
    pub active_workers: i64,
    pub type_rates: Vec<TypeRates>,
    pub throughput: Throughput,
    pub fairness: FairnessReport,
}

/// Read-only queries over the task store.
#[derive(Clone)]
pub struct QueueViews {
    pool: SqlitePool,
    clock: SharedClock,
}

impl QueueViews {
    pub fn new(pool: SqlitePool, clock: SharedClock) -> Self {
        Self { pool, clock }
    }

    /// Task counts by status and type.
    pub async fn queue_depth(&self) -> Result<Vec<QueueDepth>, StorageError> {
        let rows = sqlx::query(
            "SELECT status, task_type, task_count FROM v_queue_depth ORDER BY status, task_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut depth = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            depth.push(QueueDepth {
                status: status.parse().map_err(|reason| StorageError::CorruptRow {
                    table: tables::TASKS,
                    reason,
                })?,
                task_type: row.try_get("task_type")?,
                count: row.try_get("task_count")?,
            });
        }
        Ok(depth)
    }

    /// Task counts by status, with every status present.
    pub async fn depth_by_status(&self) -> Result<BTreeMap<TaskStatus, i64>, StorageError> {
        let mut totals: BTreeMap<TaskStatus, i64> =
            TaskStatus::ALL.iter().map(|&s| (s, 0)).collect();
        for entry in self.queue_depth().await? {
            *totals.entry(entry.status).or_insert(0) += entry.count;
        }
        Ok(totals)
    }

    /// Workers whose last heartbeat is within `ttl`.
    pub async fn active_worker_count(&self, ttl: Duration) -> Result<i64, StorageError> {
        let cutoff = earlier_by(self.clock.now(), ttl);
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM worker_heartbeats WHERE last_heartbeat >= ?")
                .bind(to_millis(cutoff))
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Worker counts by advertised status.
    pub async fn workers_by_status(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        let rows = sqlx::query("SELECT status, worker_count FROM v_worker_status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            counts.insert(row.try_get("status")?, row.try_get("worker_count")?);
        }
        Ok(counts)
    }

    /// Per-type retry and failure rates.
    pub async fn type_rates(&self) -> Result<Vec<TypeRates>, StorageError> {
        let rows = sqlx::query(
            "SELECT task_type, total, completed, failed, cancelled, total_retries, \
             failure_rate, retry_rate FROM v_task_type_rates ORDER BY task_type",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut rates = Vec::with_capacity(rows.len());
        for row in rows {
            rates.push(TypeRates {
                task_type: row.try_get("task_type")?,
                total: row.try_get("total")?,
                completed: row.try_get("completed")?,
                failed: row.try_get("failed")?,
                cancelled: row.try_get("cancelled")?,
                total_retries: row.try_get("total_retries")?,
                failure_rate: row.try_get("failure_rate")?,
                retry_rate: row.try_get("retry_rate")?,
            });
        }
        Ok(rates)
    }

    /// Tasks that reached `completed` or `failed` within the trailing `window`.
    pub async fn throughput(&self, window: Duration) -> Result<Throughput, StorageError> {
        let cutoff = earlier_by(self.clock.now(), window);
        let row = sqlx::query(
            "SELECT \
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed, \
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed \
             FROM tasks WHERE completed_at IS NOT NULL AND completed_at >= ?",
        )
        .bind(to_millis(cutoff))
        .fetch_one(&self.pool)
        .await?;

        let completed: i64 = row.try_get("completed")?;
        let failed: i64 = row.try_get("failed")?;
        let minutes = window.as_secs_f64() / 60.0;
        let per_minute = if minutes > 0.0 {
            completed as f64 / minutes
        } else {
            0.0
        };

        Ok(Throughput {
            window_secs: window.as_secs(),
            completed,
            failed,
            per_minute,
        })
    }

    /// Seconds between eligibility and claim for claimed tasks, newest first.
    ///
    /// A re-queued task loses its claim time, so only the latest attempt of
    /// each task is counted.
    pub async fn wait_times(&self, limit: i64) -> Result<Vec<f64>, StorageError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT MAX(claimed_at - run_after, 0) FROM tasks \
             WHERE claimed_at IS NOT NULL ORDER BY claimed_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(ms,)| ms as f64 / 1000.0).collect())
    }

    /// Fairness of the last `limit` waits.
    pub async fn fairness(&self, limit: i64) -> Result<FairnessReport, StorageError> {
        Ok(FairnessReport::from_wait_times(&self.wait_times(limit).await?))
    }

    /// One-shot snapshot of every aggregate.
    pub async fn snapshot(
        &self,
        heartbeat_ttl: Duration,
        throughput_window: Duration,
    ) -> Result<QueueStats, StorageError> {
        let depth = self.queue_depth().await?;
        let depth_by_status = self
            .depth_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();

        Ok(QueueStats {
            depth_by_status,
            depth,
            active_workers: self.active_worker_count(heartbeat_ttl).await?,
            type_rates: self.type_rates().await?,
            throughput: self.throughput(throughput_window).await?,
            fairness: self.fairness(10_000).await?,
        })
    }
}
