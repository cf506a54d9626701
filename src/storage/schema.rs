//! Database schema constants and SQL queries.
//!
//! This module contains all SQL schema definitions for the SQLite storage
//! backend. Timestamps are stored as INTEGER unix milliseconds and JSON
//! payloads as TEXT.

/// SQL schema for creating the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL CHECK (length(task_type) > 0),
    parameters TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0 CHECK (priority BETWEEN 0 AND 100),
    run_after INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'claimed', 'running', 'completed', 'failed', 'cancelled')),
    claimed_by TEXT,
    claimed_at INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    max_retries INTEGER NOT NULL DEFAULT 3 CHECK (max_retries >= 0),
    result TEXT,
    error_message TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    CHECK (retry_count <= max_retries),
    CHECK (status <> 'queued' OR claimed_by IS NULL),
    CHECK (status NOT IN ('claimed', 'running') OR claimed_by IS NOT NULL)
)
"#;

/// SQL schema for creating the worker_heartbeats table.
///
/// `current_task_id` is a weak reference: no foreign key, the task may be
/// gone or reassigned.
pub const CREATE_WORKER_HEARTBEATS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS worker_heartbeats (
    worker_id TEXT PRIMARY KEY,
    status TEXT NOT NULL CHECK (status IN ('idle', 'busy', 'stopping')),
    last_heartbeat INTEGER NOT NULL,
    processed_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    current_task_id INTEGER,
    policy TEXT,
    started_at INTEGER NOT NULL
)
"#;

/// SQL schema for creating the task_logs table.
pub const CREATE_TASK_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS task_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    worker_id TEXT,
    event TEXT NOT NULL CHECK (event IN (
        'created', 'claimed', 'started', 'progress', 'completed',
        'failed', 'retried', 'reclaimed', 'cancelled', 'released'
    )),
    message TEXT NOT NULL,
    details TEXT,
    created_at INTEGER NOT NULL
)
"#;

/// SQL for creating all required indexes, one statement each.
pub const CREATE_INDEXES: [&str; 6] = [
    "CREATE INDEX IF NOT EXISTS idx_tasks_eligible ON tasks(status, run_after)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(status, priority DESC, created_at, id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_claimed_by ON tasks(claimed_by)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(task_type, status)",
    "CREATE INDEX IF NOT EXISTS idx_task_logs_task_id ON task_logs(task_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_worker_heartbeats_last ON worker_heartbeats(last_heartbeat)",
];

/// Queue depth by status and task type.
pub const CREATE_QUEUE_DEPTH_VIEW: &str = r#"
CREATE VIEW IF NOT EXISTS v_queue_depth AS
SELECT status, task_type, COUNT(*) AS task_count
FROM tasks
GROUP BY status, task_type
"#;

/// Worker count by advertised status, with the freshest heartbeat of each group.
pub const CREATE_WORKER_STATUS_VIEW: &str = r#"
CREATE VIEW IF NOT EXISTS v_worker_status AS
SELECT status, COUNT(*) AS worker_count, MAX(last_heartbeat) AS newest_heartbeat
FROM worker_heartbeats
GROUP BY status
"#;

/// Per-type retry and failure rates.
///
/// `failure_rate` is failed / (completed + failed); `retry_rate` is the
/// share of tasks that needed at least one retry.
pub const CREATE_TYPE_RATES_VIEW: &str = r#"
CREATE VIEW IF NOT EXISTS v_task_type_rates AS
SELECT
    task_type,
    COUNT(*) AS total,
    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS completed,
    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed,
    SUM(CASE WHEN status = 'cancelled' THEN 1 ELSE 0 END) AS cancelled,
    SUM(retry_count) AS total_retries,
    COALESCE(
        SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) * 1.0
            / NULLIF(SUM(CASE WHEN status IN ('completed', 'failed') THEN 1 ELSE 0 END), 0),
        0.0
    ) AS failure_rate,
    SUM(CASE WHEN retry_count > 0 THEN 1 ELSE 0 END) * 1.0 / COUNT(*) AS retry_rate
FROM tasks
GROUP BY task_type
"#;

/// Returns all table and index creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![
        CREATE_TASKS_TABLE,
        CREATE_WORKER_HEARTBEATS_TABLE,
        CREATE_TASK_LOGS_TABLE,
    ];
    statements.extend(CREATE_INDEXES);
    statements
}

/// Returns all view creation statements.
pub fn all_view_statements() -> Vec<&'static str> {
    vec![
        CREATE_QUEUE_DEPTH_VIEW,
        CREATE_WORKER_STATUS_VIEW,
        CREATE_TYPE_RATES_VIEW,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Tasks table name.
    pub const TASKS: &str = "tasks";
    /// Worker heartbeats table name.
    pub const WORKER_HEARTBEATS: &str = "worker_heartbeats";
    /// Task logs table name.
    pub const TASK_LOGS: &str = "task_logs";
}

/// View names in the schema.
pub mod views {
    pub const QUEUE_DEPTH: &str = "v_queue_depth";
    pub const WORKER_STATUS: &str = "v_worker_status";
    pub const TASK_TYPE_RATES: &str = "v_task_type_rates";
}
