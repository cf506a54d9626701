//! SQLite-backed task store.
//!
//! `TaskStore` owns the durable state of tasks, worker heartbeats and the
//! task log. Cross-worker coordination relies on one primitive:
//! [`TaskStore::transition`], a single-statement compare-and-swap on the
//! task status.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::clock::{earlier_by, system_clock, SharedClock};
use crate::error::{QueueError, StorageError, ValidationError};
use crate::metrics::MetricsCollector;
use crate::scheduler::policy::SchedulingPolicy;
use crate::scheduler::registry::TaskRegistry;
use crate::scheduler::task::{
    HeartbeatMetrics, LogEvent, NewLogEntry, NewTask, Task, TaskId, TaskLogEntry, TaskStatus,
    TaskUpdate, WorkerHeartbeat, WorkerStatus, DEFAULT_MAX_RETRIES, MAX_PRIORITY, MIN_PRIORITY,
};

use super::migrations::MigrationRunner;
use super::schema::tables;
use super::views::QueueViews;

const TASK_COLUMNS: &str = "id, task_type, parameters, priority, run_after, status, claimed_by, \
     claimed_at, retry_count, max_retries, result, error_message, cancel_requested, \
     created_at, updated_at, completed_at";

const HEARTBEAT_COLUMNS: &str = "worker_id, status, last_heartbeat, processed_count, \
     failed_count, current_task_id, policy, started_at";

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still queued and is now `cancelled`.
    Cancelled,
    /// The task is held by a worker; it has been flagged and the worker
    /// will stop it.
    Requested,
    /// The task had already reached a terminal status.
    AlreadyFinished(TaskStatus),
}

/// Durable store for tasks, heartbeats and task logs.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
    registry: Arc<TaskRegistry>,
    clock: SharedClock,
    default_max_retries: u32,
    metrics: MetricsCollector,
}

impl TaskStore {
    /// Connects to the database and returns a new store.
    ///
    /// `sqlite::memory:` URLs are routed to [`TaskStore::in_memory`].
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        registry: Arc<TaskRegistry>,
    ) -> Result<Self, StorageError> {
        if database_url.contains(":memory:") {
            return Self::in_memory(registry).await;
        }

        let opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(opts)
            .await?;

        info!(database_url, max_connections, "Task store opened");
        Ok(Self::from_pool(pool, registry))
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds exactly one connection that is never recycled, since
    /// every SQLite memory connection is its own database.
    pub async fn in_memory(registry: Arc<TaskRegistry>) -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Ok(Self::from_pool(pool, registry))
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: SqlitePool, registry: Arc<TaskRegistry>) -> Self {
        Self {
            pool,
            registry,
            clock: system_clock(),
            default_max_retries: DEFAULT_MAX_RETRIES,
            metrics: MetricsCollector::new(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the retry ceiling applied to submissions without one.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Read-only aggregates over this store.
    pub fn views(&self) -> QueueViews {
        QueueViews::new(self.pool.clone(), self.clock.clone())
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<usize, StorageError> {
        MigrationRunner::new(self.pool.clone()).run_migrations().await
    }

    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Validates and inserts a task in status `queued`.
    pub async fn enqueue(&self, task: NewTask) -> Result<TaskId, QueueError> {
        self.validate_submission(&task)?;

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let id = insert_task(&mut tx, &task, now, self.default_max_retries).await?;
        tx.commit().await?;

        self.metrics.record_enqueued(&task.task_type);
        debug!(task_id = %id, task_type = %task.task_type, priority = task.priority, "Task enqueued");
        Ok(id)
    }

    /// Validates every submission, then inserts all of them in one transaction.
    ///
    /// Either every task is stored or none is.
    pub async fn enqueue_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<TaskId>, QueueError> {
        for task in &tasks {
            self.validate_submission(task)?;
        }

        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(tasks.len());
        for task in &tasks {
            ids.push(insert_task(&mut tx, task, now, self.default_max_retries).await?);
        }
        tx.commit().await?;

        for task in &tasks {
            self.metrics.record_enqueued(&task.task_type);
        }
        info!(count = ids.len(), "Task batch enqueued");
        Ok(ids)
    }

    fn validate_submission(&self, task: &NewTask) -> Result<(), ValidationError> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&task.priority) {
            return Err(ValidationError::PriorityOutOfRange {
                priority: task.priority,
                min: MIN_PRIORITY,
                max: MAX_PRIORITY,
            });
        }
        self.registry.validate(&task.task_type, &task.parameters)
    }

    /// Fetches a task, failing with `NotFound` if it does not exist.
    pub async fn get(&self, id: TaskId) -> Result<Task, QueueError> {
        self.find(id).await?.ok_or(QueueError::NotFound(id))
    }

    /// Fetches a task if it exists.
    pub async fn find(&self, id: TaskId) -> Result<Option<Task>, StorageError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Lists tasks matching the filter, oldest first.
    pub async fn list_by_filter(&self, filter: &TaskFilter) -> Result<Vec<Task>, StorageError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM tasks WHERE 1 = 1", TASK_COLUMNS));

        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(ref task_type) = filter.task_type {
            qb.push(" AND task_type = ").push_bind(task_type.clone());
        }
        if let Some(ref worker_id) = filter.worker_id {
            qb.push(" AND claimed_by = ").push_bind(worker_id.clone());
        }

        qb.push(" ORDER BY created_at ASC, id ASC");

        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
        if filter.limit.is_some() || filter.offset.is_some() {
            qb.push(" LIMIT ").push_bind(filter.limit.unwrap_or(-1));
            if let Some(offset) = filter.offset {
                qb.push(" OFFSET ").push_bind(offset);
            }
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Compare-and-swap on the task status.
    ///
    /// Applies `update` and moves the task to `new` only if it is currently
    /// in `expected`. Returns `false` on mismatch. Moving to `queued` always
    /// clears the claim, and is refused while cancellation is pending so a
    /// requested cancel cannot be lost to a requeue.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `expected -> new` is not a lifecycle edge.
    pub async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        new: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, QueueError> {
        self.apply_transition(id, None, expected, new, update).await
    }

    /// Like [`TaskStore::transition`], but also requires `claimed_by = worker_id`.
    pub async fn transition_owned(
        &self,
        id: TaskId,
        worker_id: &str,
        expected: TaskStatus,
        new: TaskStatus,
        update: TaskUpdate,
    ) -> Result<bool, QueueError> {
        self.apply_transition(id, Some(worker_id), expected, new, update)
            .await
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        owner: Option<&str>,
        expected: TaskStatus,
        new: TaskStatus,
        mut update: TaskUpdate,
    ) -> Result<bool, QueueError> {
        if !expected.can_transition_to(new) {
            return Err(QueueError::InvalidTransition {
                from: expected,
                to: new,
            });
        }
        if new == TaskStatus::Queued {
            update.claimed_by = Some(None);
            update.claimed_at = Some(None);
        }

        let now = self.clock.now();
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE tasks SET status = ");
        qb.push_bind(new.as_str());
        qb.push(", updated_at = ").push_bind(to_millis(now));

        if let Some(claimed_by) = update.claimed_by {
            qb.push(", claimed_by = ").push_bind(claimed_by);
        }
        if let Some(claimed_at) = update.claimed_at {
            qb.push(", claimed_at = ").push_bind(claimed_at.map(to_millis));
        }
        if let Some(run_after) = update.run_after {
            qb.push(", run_after = ").push_bind(to_millis(run_after));
        }
        if let Some(retry_count) = update.retry_count {
            qb.push(", retry_count = ").push_bind(i64::from(retry_count));
        }
        if let Some(result) = update.result {
            qb.push(", result = ").push_bind(serde_json::to_string(&result)?);
        }
        if let Some(error_message) = update.error_message {
            qb.push(", error_message = ").push_bind(error_message);
        }
        if let Some(completed_at) = update.completed_at {
            qb.push(", completed_at = ").push_bind(to_millis(completed_at));
        }

        qb.push(" WHERE id = ").push_bind(id.get());
        qb.push(" AND status = ").push_bind(expected.as_str());
        if let Some(owner) = owner {
            qb.push(" AND claimed_by = ").push_bind(owner.to_string());
        }
        if new == TaskStatus::Queued {
            qb.push(" AND cancel_requested = 0");
        }

        let result = qb.build().execute(&self.pool).await?;
        let swapped = result.rows_affected() == 1;
        debug!(
            task_id = %id,
            from = %expected,
            to = %new,
            swapped,
            "Task transition"
        );
        Ok(swapped)
    }

    /// Queued tasks with `run_after <= now` in policy order.
    ///
    /// `task_types = Some(&[])` matches nothing.
    pub async fn eligible_tasks(
        &self,
        now: DateTime<Utc>,
        policy: SchedulingPolicy,
        limit: usize,
        task_types: Option<&[String]>,
    ) -> Result<Vec<Task>, StorageError> {
        if matches!(task_types, Some(types) if types.is_empty()) || limit == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM tasks WHERE status = 'queued' AND run_after <= ",
            TASK_COLUMNS
        ));
        qb.push_bind(to_millis(now));

        if let Some(types) = task_types {
            qb.push(" AND task_type IN (");
            let mut separated = qb.separated(", ");
            for task_type in types {
                separated.push_bind(task_type.clone());
            }
            separated.push_unseparated(")");
        }

        qb.push(" ORDER BY ").push(policy.order_by_clause());
        qb.push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    /// `(id, priority)` of every queued task with `run_after <= now`.
    ///
    /// Weighted-random sampling needs the whole eligible set, so only the
    /// two columns it weighs on are read.
    pub async fn eligible_weights(
        &self,
        now: DateTime<Utc>,
        task_types: Option<&[String]>,
    ) -> Result<Vec<(TaskId, i32)>, StorageError> {
        if matches!(task_types, Some(types) if types.is_empty()) {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, priority FROM tasks WHERE status = 'queued' AND run_after <= ",
        );
        qb.push_bind(to_millis(now));

        if let Some(types) = task_types {
            qb.push(" AND task_type IN (");
            let mut separated = qb.separated(", ");
            for task_type in types {
                separated.push_bind(task_type.clone());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY id");

        let rows: Vec<(i64, i32)> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(id, priority)| (TaskId(id), priority))
            .collect())
    }

    /// Tasks held (`claimed` or `running`) by `worker_id`.
    pub async fn list_claims_by_worker(&self, worker_id: &str) -> Result<Vec<Task>, StorageError> {
        let sql = format!(
            "SELECT {} FROM tasks WHERE status IN ('claimed', 'running') AND claimed_by = ? \
             ORDER BY id",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Held tasks claimed before `cutoff` by workers with no heartbeat row.
    pub async fn list_orphaned_claims(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Task>, StorageError> {
        let sql = format!(
            "SELECT {} FROM tasks \
             WHERE status IN ('claimed', 'running') \
               AND claimed_at < ? \
               AND NOT EXISTS ( \
                   SELECT 1 FROM worker_heartbeats h WHERE h.worker_id = tasks.claimed_by \
               ) \
             ORDER BY id",
            TASK_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(cutoff))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Requests cancellation of a task.
    ///
    /// A queued task is cancelled at once. A held task is flagged and its
    /// worker stops it on its next heartbeat.
    pub async fn request_cancel(&self, id: TaskId) -> Result<CancelOutcome, QueueError> {
        // Bounded: each lost race means the task moved forward in its lifecycle.
        for _ in 0..8 {
            let task = self.get(id).await?;
            let now = self.clock.now();
            match task.status {
                TaskStatus::Queued => {
                    let update = TaskUpdate::finish_with_error("cancelled before execution", now);
                    if self
                        .transition(id, TaskStatus::Queued, TaskStatus::Cancelled, update)
                        .await?
                    {
                        self.append_log(NewLogEntry::new(
                            id,
                            LogEvent::Cancelled,
                            "cancelled before execution",
                        ))
                        .await?;
                        self.metrics.record_finished(&task.task_type, TaskStatus::Cancelled);
                        info!(task_id = %id, "Queued task cancelled");
                        return Ok(CancelOutcome::Cancelled);
                    }
                }
                TaskStatus::Claimed | TaskStatus::Running => {
                    let result = sqlx::query(
                        "UPDATE tasks SET cancel_requested = 1, updated_at = ? \
                         WHERE id = ? AND status IN ('claimed', 'running')",
                    )
                    .bind(to_millis(now))
                    .bind(id.get())
                    .execute(&self.pool)
                    .await
                    .map_err(StorageError::from)?;
                    if result.rows_affected() == 1 {
                        info!(task_id = %id, worker_id = ?task.claimed_by, "Cancellation requested");
                        return Ok(CancelOutcome::Requested);
                    }
                }
                status => return Ok(CancelOutcome::AlreadyFinished(status)),
            }
        }
        Err(QueueError::ClaimConflict { task_id: id })
    }

    /// Returns whether cancellation was requested for a held task.
    pub async fn is_cancel_requested(&self, id: TaskId) -> Result<bool, StorageError> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT cancel_requested FROM tasks WHERE id = ?")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(requested,)| requested).unwrap_or(false))
    }

    // =========================================================================
    // Heartbeat Operations
    // =========================================================================

    /// Inserts or refreshes the heartbeat row of `worker_id`.
    ///
    /// `started_at` is set on the first heartbeat only.
    pub async fn record_heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        metrics: &HeartbeatMetrics,
    ) -> Result<(), StorageError> {
        let now = to_millis(self.clock.now());
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats
                (worker_id, status, last_heartbeat, processed_count, failed_count,
                 current_task_id, policy, started_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(worker_id) DO UPDATE SET
                status = excluded.status,
                last_heartbeat = excluded.last_heartbeat,
                processed_count = excluded.processed_count,
                failed_count = excluded.failed_count,
                current_task_id = excluded.current_task_id,
                policy = excluded.policy
            "#,
        )
        .bind(worker_id)
        .bind(status.as_str())
        .bind(now)
        .bind(i64::try_from(metrics.processed_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(metrics.failed_count).unwrap_or(i64::MAX))
        .bind(metrics.current_task.map(TaskId::get))
        .bind(metrics.policy.clone())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetches the heartbeat row of `worker_id`.
    pub async fn get_heartbeat(&self, worker_id: &str) -> Result<Option<WorkerHeartbeat>, StorageError> {
        let sql = format!(
            "SELECT {} FROM worker_heartbeats WHERE worker_id = ?",
            HEARTBEAT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(heartbeat_from_row).transpose()
    }

    /// All heartbeat rows, ordered by worker id.
    pub async fn list_heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StorageError> {
        let sql = format!(
            "SELECT {} FROM worker_heartbeats ORDER BY worker_id",
            HEARTBEAT_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(heartbeat_from_row).collect()
    }

    /// Heartbeats older than `ttl`.
    pub async fn list_stale_heartbeats(&self, ttl: Duration) -> Result<Vec<WorkerHeartbeat>, StorageError> {
        let cutoff = earlier_by(self.clock.now(), ttl);
        let sql = format!(
            "SELECT {} FROM worker_heartbeats WHERE last_heartbeat < ? ORDER BY last_heartbeat",
            HEARTBEAT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(cutoff))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(heartbeat_from_row).collect()
    }

    /// Deletes the heartbeat row of `worker_id`. Returns whether one existed.
    pub async fn remove_heartbeat(&self, worker_id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM worker_heartbeats WHERE worker_id = ?")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the heartbeat row only if it was not refreshed since `seen_at`.
    pub async fn remove_heartbeat_if_unchanged(
        &self,
        worker_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result =
            sqlx::query("DELETE FROM worker_heartbeats WHERE worker_id = ? AND last_heartbeat = ?")
                .bind(worker_id)
                .bind(to_millis(seen_at))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Task Log Operations
    // =========================================================================

    /// Appends an audit record.
    pub async fn append_log(&self, entry: NewLogEntry) -> Result<i64, StorageError> {
        insert_log(&self.pool, &entry, self.clock.now()).await
    }

    /// Audit records of a task, oldest first.
    pub async fn list_logs(&self, task_id: TaskId) -> Result<Vec<TaskLogEntry>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, task_id, worker_id, event, message, details, created_at \
             FROM task_logs WHERE task_id = ? ORDER BY id",
        )
        .bind(task_id.get())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }
}

/// Filter criteria for listing tasks.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    /// Filter by status.
    pub status: Option<TaskStatus>,
    /// Filter by task type.
    pub task_type: Option<String>,
    /// Filter by claiming worker.
    pub worker_id: Option<String>,
    /// Maximum number of results.
    pub limit: Option<i64>,
    /// Offset for pagination.
    pub offset: Option<i64>,
}

impl TaskFilter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status filter.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the task type filter.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Sets the worker filter.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Sets the result limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset for pagination.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64, table: &'static str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StorageError::CorruptRow {
        table,
        reason: format!("timestamp {} out of range", ms),
    })
}

fn count_u32(value: i64, column: &str) -> Result<u32, StorageError> {
    u32::try_from(value).map_err(|_| StorageError::CorruptRow {
        table: tables::TASKS,
        reason: format!("{} = {} does not fit u32", column, value),
    })
}

async fn insert_task(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    task: &NewTask,
    now: DateTime<Utc>,
    default_max_retries: u32,
) -> Result<TaskId, StorageError> {
    let run_after = task.run_after.unwrap_or(now);
    let max_retries = task.max_retries.unwrap_or(default_max_retries);

    let result = sqlx::query(
        r#"
        INSERT INTO tasks
            (task_type, parameters, priority, run_after, status, retry_count, max_retries,
             cancel_requested, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'queued', 0, ?, 0, ?, ?)
        "#,
    )
    .bind(&task.task_type)
    .bind(serde_json::to_string(&task.parameters)?)
    .bind(task.priority)
    .bind(to_millis(run_after))
    .bind(i64::from(max_retries))
    .bind(to_millis(now))
    .bind(to_millis(now))
    .execute(&mut **tx)
    .await?;

    let id = TaskId(result.last_insert_rowid());
    let entry = NewLogEntry::new(id, LogEvent::Created, format!("enqueued as {}", task.task_type))
        .with_details(serde_json::json!({
            "priority": task.priority,
            "max_retries": max_retries,
        }));
    insert_log(&mut **tx, &entry, now).await?;
    Ok(id)
}

async fn insert_log<'e, E>(
    executor: E,
    entry: &NewLogEntry,
    at: DateTime<Utc>,
) -> Result<i64, StorageError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let details = entry
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        "INSERT INTO task_logs (task_id, worker_id, event, message, details, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.task_id.get())
    .bind(entry.worker_id.as_deref())
    .bind(entry.event.as_str())
    .bind(&entry.message)
    .bind(details)
    .bind(to_millis(at))
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StorageError> {
    let status: String = row.try_get("status")?;
    let status = TaskStatus::from_str(&status).map_err(|reason| StorageError::CorruptRow {
        table: tables::TASKS,
        reason,
    })?;
    let parameters: String = row.try_get("parameters")?;
    let result: Option<String> = row.try_get("result")?;
    let claimed_at: Option<i64> = row.try_get("claimed_at")?;
    let completed_at: Option<i64> = row.try_get("completed_at")?;

    Ok(Task {
        id: TaskId(row.try_get("id")?),
        task_type: row.try_get("task_type")?,
        parameters: serde_json::from_str(&parameters)?,
        priority: row.try_get("priority")?,
        run_after: from_millis(row.try_get("run_after")?, tables::TASKS)?,
        status,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: claimed_at
            .map(|ms| from_millis(ms, tables::TASKS))
            .transpose()?,
        retry_count: count_u32(row.try_get("retry_count")?, "retry_count")?,
        max_retries: count_u32(row.try_get("max_retries")?, "max_retries")?,
        result: result.as_deref().map(serde_json::from_str).transpose()?,
        error_message: row.try_get("error_message")?,
        cancel_requested: row.try_get("cancel_requested")?,
        created_at: from_millis(row.try_get("created_at")?, tables::TASKS)?,
        updated_at: from_millis(row.try_get("updated_at")?, tables::TASKS)?,
        completed_at: completed_at
            .map(|ms| from_millis(ms, tables::TASKS))
            .transpose()?,
    })
}

fn heartbeat_from_row(row: &SqliteRow) -> Result<WorkerHeartbeat, StorageError> {
    let status: String = row.try_get("status")?;
    let status = WorkerStatus::from_str(&status).map_err(|reason| StorageError::CorruptRow {
        table: tables::WORKER_HEARTBEATS,
        reason,
    })?;
    let processed: i64 = row.try_get("processed_count")?;
    let failed: i64 = row.try_get("failed_count")?;
    let current_task: Option<i64> = row.try_get("current_task_id")?;

    Ok(WorkerHeartbeat {
        worker_id: row.try_get("worker_id")?,
        status,
        last_heartbeat: from_millis(row.try_get("last_heartbeat")?, tables::WORKER_HEARTBEATS)?,
        processed_count: u64::try_from(processed).unwrap_or(0),
        failed_count: u64::try_from(failed).unwrap_or(0),
        current_task: current_task.map(TaskId),
        policy: row.try_get("policy")?,
        started_at: from_millis(row.try_get("started_at")?, tables::WORKER_HEARTBEATS)?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<TaskLogEntry, StorageError> {
    let event: String = row.try_get("event")?;
    let event = LogEvent::from_str(&event).map_err(|reason| StorageError::CorruptRow {
        table: tables::TASK_LOGS,
        reason,
    })?;
    let details: Option<String> = row.try_get("details")?;

    Ok(TaskLogEntry {
        id: row.try_get("id")?,
        task_id: TaskId(row.try_get("task_id")?),
        worker_id: row.try_get("worker_id")?,
        event,
        message: row.try_get("message")?,
        details: details.as_deref().map(serde_json::from_str).transpose()?,
        created_at: from_millis(row.try_get("created_at")?, tables::TASK_LOGS)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    async fn store_with_clock() -> (TaskStore, ManualClock) {
        let mut registry = TaskRegistry::new();
        registry
            .register_dynamic("echo", |_| Ok(()))
            .expect("register echo");
        registry
            .register_dynamic("scrape", |v| {
                v.get("url")
                    .and_then(|u| u.as_str())
                    .map(|_| ())
                    .ok_or_else(|| "missing string field 'url'".to_string())
            })
            .expect("register scrape");

        let clock = ManualClock::starting_now();
        let store = TaskStore::in_memory(Arc::new(registry))
            .await
            .expect("store")
            .with_clock(Arc::new(clock.clone()));
        store.run_migrations().await.expect("migrate");
        (store, clock)
    }

    #[test]
    fn test_task_filter_builder() {
        let filter = TaskFilter::new()
            .with_status(TaskStatus::Queued)
            .with_task_type("echo")
            .with_worker_id("w-1")
            .with_limit(10)
            .with_offset(5);

        assert_eq!(filter.status, Some(TaskStatus::Queued));
        assert_eq!(filter.task_type, Some("echo".to_string()));
        assert_eq!(filter.worker_id, Some("w-1".to_string()));
        assert_eq!(filter.limit, Some(10));
        assert_eq!(filter.offset, Some(5));
    }

    #[test]
    fn test_millis_conversion() {
        let t = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).expect("valid");
        assert_eq!(from_millis(to_millis(t), "tasks").expect("in range"), t);
        assert!(from_millis(i64::MAX, "tasks").is_err());
    }

    #[tokio::test]
    async fn test_enqueue_and_get() {
        let (store, _clock) = store_with_clock().await;
        let params = serde_json::json!({"url": "https://example.com", "tags": ["a", "b"]});
        let id = store
            .enqueue(NewTask::new("scrape", params.clone()).with_priority(7))
            .await
            .expect("enqueue");

        let task = store.get(id).await.expect("get");
        assert_eq!(task.task_type, "scrape");
        assert_eq!(task.parameters, params);
        assert_eq!(task.priority, 7);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert!(task.claimed_by.is_none());

        let logs = store.list_logs(id).await.expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, LogEvent::Created);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid_submissions() {
        let (store, _clock) = store_with_clock().await;

        let err = store
            .enqueue(NewTask::new("scrape", serde_json::json!({"uri": 1})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Validation(ValidationError::InvalidParameters { .. })
        ));

        let err = store
            .enqueue(NewTask::new("unknown", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Validation(ValidationError::UnknownTaskType(_))
        ));

        let err = store
            .enqueue(NewTask::new("echo", serde_json::json!({})).with_priority(101))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::Validation(ValidationError::PriorityOutOfRange { .. })
        ));

        let all = store.list_by_filter(&TaskFilter::new()).await.expect("list");
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (store, _clock) = store_with_clock().await;
        let err = store.get(TaskId(999)).await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(TaskId(999))));
    }

    #[tokio::test]
    async fn test_enqueue_batch_is_atomic() {
        let (store, _clock) = store_with_clock().await;
        let result = store
            .enqueue_batch(vec![
                NewTask::new("echo", serde_json::json!({})),
                NewTask::new("scrape", serde_json::json!({})),
            ])
            .await;
        assert!(result.is_err());
        assert!(store
            .list_by_filter(&TaskFilter::new())
            .await
            .expect("list")
            .is_empty());

        let ids = store
            .enqueue_batch(vec![
                NewTask::new("echo", serde_json::json!({"n": 1})),
                NewTask::new("echo", serde_json::json!({"n": 2})),
            ])
            .await
            .expect("batch");
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
    }

    #[tokio::test]
    async fn test_transition_cas() {
        let (store, clock) = store_with_clock().await;
        let id = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");

        let claimed = store
            .transition(
                id,
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskUpdate::claim("w-1", clock.now()),
            )
            .await
            .expect("transition");
        assert!(claimed);

        let again = store
            .transition(
                id,
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskUpdate::claim("w-2", clock.now()),
            )
            .await
            .expect("transition");
        assert!(!again);

        let task = store.get(id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.claimed_by.as_deref(), Some("w-1"));
    }

    #[tokio::test]
    async fn test_transition_rejects_illegal_edges() {
        let (store, _clock) = store_with_clock().await;
        let id = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");

        let err = store
            .transition(id, TaskStatus::Queued, TaskStatus::Completed, TaskUpdate::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TaskStatus::Queued,
                to: TaskStatus::Completed
            }
        ));
    }

    #[tokio::test]
    async fn test_transition_owned_checks_owner() {
        let (store, clock) = store_with_clock().await;
        let id = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");
        store
            .transition(
                id,
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskUpdate::claim("w-1", clock.now()),
            )
            .await
            .expect("claim");

        let stolen = store
            .transition_owned(id, "w-2", TaskStatus::Claimed, TaskStatus::Running, TaskUpdate::none())
            .await
            .expect("transition");
        assert!(!stolen);

        let started = store
            .transition_owned(id, "w-1", TaskStatus::Claimed, TaskStatus::Running, TaskUpdate::none())
            .await
            .expect("transition");
        assert!(started);
    }

    #[tokio::test]
    async fn test_requeue_clears_claim() {
        let (store, clock) = store_with_clock().await;
        let id = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");
        store
            .transition(
                id,
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskUpdate::claim("w-1", clock.now()),
            )
            .await
            .expect("claim");
        store
            .transition(id, TaskStatus::Claimed, TaskStatus::Queued, TaskUpdate::none())
            .await
            .expect("requeue");

        let task = store.get(id).await.expect("get");
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.claimed_by.is_none());
        assert!(task.claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_eligible_tasks_respects_run_after_and_types() {
        let (store, clock) = store_with_clock().await;
        let now = clock.now();
        let ready = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");
        store
            .enqueue(
                NewTask::new("echo", serde_json::json!({}))
                    .with_run_after(now + chrono::Duration::seconds(60)),
            )
            .await
            .expect("enqueue");
        let scrape = store
            .enqueue(NewTask::new("scrape", serde_json::json!({"url": "https://x"})))
            .await
            .expect("enqueue");

        let eligible = store
            .eligible_tasks(store.now(), SchedulingPolicy::Fifo, 10, None)
            .await
            .expect("eligible");
        let ids: Vec<TaskId> = eligible.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![ready, scrape]);

        let only_scrape = store
            .eligible_tasks(
                store.now(),
                SchedulingPolicy::Fifo,
                10,
                Some(&["scrape".to_string()]),
            )
            .await
            .expect("eligible");
        assert_eq!(only_scrape.len(), 1);
        assert_eq!(only_scrape[0].id, scrape);

        let none = store
            .eligible_tasks(store.now(), SchedulingPolicy::Fifo, 10, Some(&[]))
            .await
            .expect("eligible");
        assert!(none.is_empty());

        clock.advance(Duration::from_secs(61));
        let later = store
            .eligible_tasks(store.now(), SchedulingPolicy::Fifo, 10, None)
            .await
            .expect("eligible");
        assert_eq!(later.len(), 3);
    }

    #[tokio::test]
    async fn test_list_by_filter_paginates() {
        let (store, _clock) = store_with_clock().await;
        for n in 0..5 {
            store
                .enqueue(NewTask::new("echo", serde_json::json!({ "n": n })))
                .await
                .expect("enqueue");
        }

        let page = store
            .list_by_filter(&TaskFilter::new().with_limit(2).with_offset(1))
            .await
            .expect("list");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].parameters["n"], 1);
        assert_eq!(page[1].parameters["n"], 2);

        let tail = store
            .list_by_filter(&TaskFilter::new().with_offset(3))
            .await
            .expect("list");
        assert_eq!(tail.len(), 2);

        let by_type = store
            .list_by_filter(&TaskFilter::new().with_task_type("scrape"))
            .await
            .expect("list");
        assert!(by_type.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_upsert_and_staleness() {
        let (store, clock) = store_with_clock().await;
        let metrics = HeartbeatMetrics {
            processed_count: 3,
            failed_count: 1,
            current_task: Some(TaskId(42)),
            policy: Some("fifo".to_string()),
        };
        store
            .record_heartbeat("w-1", WorkerStatus::Busy, &metrics)
            .await
            .expect("heartbeat");
        let first = store.get_heartbeat("w-1").await.expect("get").expect("row");
        assert_eq!(first.processed_count, 3);
        assert_eq!(first.current_task, Some(TaskId(42)));

        clock.advance(Duration::from_secs(10));
        store
            .record_heartbeat("w-1", WorkerStatus::Idle, &HeartbeatMetrics::default())
            .await
            .expect("heartbeat");
        let second = store.get_heartbeat("w-1").await.expect("get").expect("row");
        assert_eq!(second.started_at, first.started_at);
        assert!(second.last_heartbeat > first.last_heartbeat);
        assert_eq!(second.status, WorkerStatus::Idle);

        assert!(store
            .list_stale_heartbeats(Duration::from_secs(30))
            .await
            .expect("stale")
            .is_empty());
        clock.advance(Duration::from_secs(31));
        let stale = store
            .list_stale_heartbeats(Duration::from_secs(30))
            .await
            .expect("stale");
        assert_eq!(stale.len(), 1);

        assert!(store.remove_heartbeat("w-1").await.expect("remove"));
        assert!(!store.remove_heartbeat("w-1").await.expect("remove"));
        assert!(store.list_heartbeats().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_request_cancel_queued_and_held() {
        let (store, clock) = store_with_clock().await;
        let queued = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");
        assert_eq!(
            store.request_cancel(queued).await.expect("cancel"),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            store.get(queued).await.expect("get").status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            store.request_cancel(queued).await.expect("cancel"),
            CancelOutcome::AlreadyFinished(TaskStatus::Cancelled)
        );

        let held = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");
        store
            .transition(
                held,
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskUpdate::claim("w-1", clock.now()),
            )
            .await
            .expect("claim");
        assert!(!store.is_cancel_requested(held).await.expect("flag"));
        assert_eq!(
            store.request_cancel(held).await.expect("cancel"),
            CancelOutcome::Requested
        );
        assert!(store.is_cancel_requested(held).await.expect("flag"));

        // A flagged task cannot slip back into the queue.
        assert!(!store
            .transition(held, TaskStatus::Claimed, TaskStatus::Queued, TaskUpdate::release())
            .await
            .expect("requeue"));
        assert_eq!(store.get(held).await.expect("get").status, TaskStatus::Claimed);
        assert!(store
            .transition(
                held,
                TaskStatus::Claimed,
                TaskStatus::Cancelled,
                TaskUpdate::finish_with_error("cancelled", clock.now()),
            )
            .await
            .expect("cancel"));
    }

    #[tokio::test]
    async fn test_orphaned_claims_need_missing_heartbeat() {
        let (store, clock) = store_with_clock().await;
        let id = store
            .enqueue(NewTask::new("echo", serde_json::json!({})))
            .await
            .expect("enqueue");
        store
            .transition(
                id,
                TaskStatus::Queued,
                TaskStatus::Claimed,
                TaskUpdate::claim("ghost", clock.now()),
            )
            .await
            .expect("claim");

        clock.advance(Duration::from_secs(60));
        let cutoff = earlier_by(store.now(), Duration::from_secs(30));
        let orphans = store.list_orphaned_claims(cutoff).await.expect("orphans");
        assert_eq!(orphans.len(), 1);

        store
            .record_heartbeat("ghost", WorkerStatus::Busy, &HeartbeatMetrics::default())
            .await
            .expect("heartbeat");
        let orphans = store.list_orphaned_claims(cutoff).await.expect("orphans");
        assert!(orphans.is_empty());
    }
}
