// SPDX-License-Identifier: MIT OR Apache-2.0
//! The scheduler's table group: task definitions and execution records.

use crate::StoreError;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// A scheduled task definition, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task id (e.g. `maintenance.log_retention`).
    pub task_id: String,
    /// Registered task class that executes this task.
    pub task_class: String,
    /// Schedule string: `cron:<expr>`, `interval:<seconds>` or `at:<iso8601>`.
    pub schedule: String,
    /// Task-specific configuration.
    pub config: serde_json::Value,
    /// Disabled tasks are never scanned as ready.
    pub enabled: bool,
    /// Creation time.
    pub created_at_utc_ms: i64,
    /// Completion time of the most recent run, if any.
    pub last_run_utc_ms: Option<i64>,
    /// Next time this task becomes ready.
    pub next_run_utc_ms: i64,
}

/// One execution attempt of a task. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Unique id of this attempt.
    pub execution_id: String,
    /// The task that ran.
    pub task_id: String,
    /// Dispatch time.
    pub started_at_utc_ms: i64,
    /// Completion time; `None` while in flight.
    pub completed_at_utc_ms: Option<i64>,
    /// Outcome; `None` while in flight.
    pub success: Option<bool>,
    /// Wall-clock duration.
    pub duration_ms: Option<i64>,
    /// Error description for failed attempts.
    pub error: Option<String>,
    /// Which retry this attempt was (0 for the first try).
    pub retry_count: i64,
}

/// Data access for the scheduler tables.
///
/// Shares the event store's pool; obtain one via
/// [`crate::EventStore::task_store`].
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a task definition.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn upsert_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scheduled_tasks \
             (task_id, task_class, schedule, config, enabled, created_at_utc_ms, \
              last_run_utc_ms, next_run_utc_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET \
               task_class = excluded.task_class, \
               schedule = excluded.schedule, \
               config = excluded.config, \
               enabled = excluded.enabled, \
               last_run_utc_ms = excluded.last_run_utc_ms, \
               next_run_utc_ms = excluded.next_run_utc_ms",
        )
        .bind(&task.task_id)
        .bind(&task.task_class)
        .bind(&task.schedule)
        .bind(task.config.to_string())
        .bind(task.enabled)
        .bind(task.created_at_utc_ms)
        .bind(task.last_run_utc_ms)
        .bind(task.next_run_utc_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one task by id.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(task_from_row).transpose()
    }

    /// All task definitions, ordered by id.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM scheduled_tasks ORDER BY task_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(task_from_row).collect()
    }

    /// Delete a task definition. Execution history is kept.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flip a task's enabled flag.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE scheduled_tasks SET enabled = ? WHERE task_id = ?")
            .bind(enabled)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the outcome of a run: completion time and the next fire time.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn mark_run(
        &self,
        task_id: &str,
        last_run_utc_ms: i64,
        next_run_utc_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE scheduled_tasks SET last_run_utc_ms = ?, next_run_utc_ms = ? \
             WHERE task_id = ?",
        )
        .bind(last_run_utc_ms)
        .bind(next_run_utc_ms)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a task's next fire time without touching `last_run_utc_ms`.
    /// This is the deferral primitive (admission pressure, retry backoff).
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn set_next_run(&self, task_id: &str, next_run_utc_ms: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE scheduled_tasks SET next_run_utc_ms = ? WHERE task_id = ?")
            .bind(next_run_utc_ms)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append a new in-flight execution record.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn begin_execution(&self, execution: &ExecutionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_executions \
             (execution_id, task_id, started_at_utc_ms, completed_at_utc_ms, success, \
              duration_ms, error, retry_count) \
             VALUES (?, ?, ?, NULL, NULL, NULL, NULL, ?)",
        )
        .bind(&execution.execution_id)
        .bind(&execution.task_id)
        .bind(execution.started_at_utc_ms)
        .bind(execution.retry_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Complete an in-flight execution record.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn finish_execution(
        &self,
        execution_id: &str,
        completed_at_utc_ms: i64,
        success: bool,
        duration_ms: i64,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE task_executions SET completed_at_utc_ms = ?, success = ?, \
             duration_ms = ?, error = ? WHERE execution_id = ?",
        )
        .bind(completed_at_utc_ms)
        .bind(success)
        .bind(duration_ms)
        .bind(error)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Execution history for a task, newest first.
    ///
    /// # Errors
    ///
    /// Database failures.
    pub async fn executions_for(
        &self,
        task_id: &str,
        limit: u32,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM task_executions WHERE task_id = ? \
             ORDER BY started_at_utc_ms DESC, execution_id DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(execution_from_row).collect()
    }
}

fn task_from_row(row: sqlx::sqlite::SqliteRow) -> Result<TaskRecord, StoreError> {
    let config_text: String = row.get("config");
    Ok(TaskRecord {
        task_id: row.get("task_id"),
        task_class: row.get("task_class"),
        schedule: row.get("schedule"),
        config: serde_json::from_str(&config_text)?,
        enabled: row.get("enabled"),
        created_at_utc_ms: row.get("created_at_utc_ms"),
        last_run_utc_ms: row.get("last_run_utc_ms"),
        next_run_utc_ms: row.get("next_run_utc_ms"),
    })
}

fn execution_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord, StoreError> {
    Ok(ExecutionRecord {
        execution_id: row.get("execution_id"),
        task_id: row.get("task_id"),
        started_at_utc_ms: row.get("started_at_utc_ms"),
        completed_at_utc_ms: row.get("completed_at_utc_ms"),
        success: row.get("success"),
        duration_ms: row.get("duration_ms"),
        error: row.get("error"),
        retry_count: row.get("retry_count"),
    })
}
