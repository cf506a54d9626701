//! Database migration helpers.
//!
//! This module provides utilities for running database migrations
//! and managing schema versions.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::StorageError;

use super::database::{from_millis, to_millis};
use super::schema;

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: SqlitePool,
}

impl MigrationRunner {
    /// Creates a new migration runner.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations.
    ///
    /// This method is idempotent - running it multiple times will not
    /// cause errors or duplicate schema objects due to IF NOT EXISTS clauses.
    pub async fn run_migrations(&self) -> Result<usize, StorageError> {
        self.ensure_migrations_table().await?;

        let mut pending = Vec::new();
        for (idx, statement) in schema::all_schema_statements().into_iter().enumerate() {
            pending.push((format!("schema_v1_part_{}", idx), statement));
        }
        for (idx, statement) in schema::all_view_statements().into_iter().enumerate() {
            pending.push((format!("views_v1_part_{}", idx), statement));
        }

        let mut applied = 0;
        for (name, statement) in pending {
            if !self.is_migration_applied(&name).await? {
                self.apply_migration(&name, statement).await?;
                applied += 1;
            }
        }

        if applied > 0 {
            info!(applied, "Applied database migrations");
        } else {
            debug!("Database schema is up to date");
        }
        Ok(applied)
    }

    /// Ensures the migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Checks if a migration has already been applied.
    async fn is_migration_applied(&self, name: &str) -> Result<bool, StorageError> {
        let result: Option<(i64,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    /// Applies a single migration.
    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Migration(format!("{}: {}", name, e)))?;

        // Another process may have raced us through the same statement.
        sqlx::query("INSERT OR IGNORE INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(to_millis(Utc::now()))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(migration = name, "Applied migration");
        Ok(())
    }

    /// Returns a list of applied migrations.
    pub async fn list_applied_migrations(&self) -> Result<Vec<AppliedMigration>, StorageError> {
        self.ensure_migrations_table().await?;

        let rows = sqlx::query("SELECT name, applied_at FROM _migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut migrations = Vec::with_capacity(rows.len());
        for row in rows {
            migrations.push(AppliedMigration {
                name: row.try_get("name")?,
                applied_at: from_millis(row.try_get("applied_at")?, "_migrations")?,
            });
        }
        Ok(migrations)
    }

    /// Resets the database by dropping all views and tables.
    ///
    /// **WARNING**: This will destroy all data! Use only in development/testing.
    pub async fn reset_database(&self) -> Result<(), StorageError> {
        warn!("Resetting database: all tasks, heartbeats and logs will be dropped");

        let drop_statements = [
            "DROP VIEW IF EXISTS v_task_type_rates",
            "DROP VIEW IF EXISTS v_worker_status",
            "DROP VIEW IF EXISTS v_queue_depth",
            "DROP TABLE IF EXISTS task_logs",
            "DROP TABLE IF EXISTS worker_heartbeats",
            "DROP TABLE IF EXISTS tasks",
            "DROP TABLE IF EXISTS _migrations",
        ];

        for statement in drop_statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(format!("Drop failed: {}", e)))?;
        }

        Ok(())
    }
}

/// Record of an applied migration.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// Name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
}
