//! SQLite persistence for instances, scheduled tasks, and the execution log.
//!
//! The store is the single source of truth for execution state. Logical
//! correctness (no two writers per account) is enforced upstream by the
//! account guard; this layer still funnels every mutation through
//! [`InstanceStore::with_write_retry`] so transient busy/locked errors from
//! the storage engine are retried with bounded backoff instead of leaking
//! to callers.

use crate::engine::retry::backoff_delay_ms;
use crate::engine::types::{
    EngineStatistics, ExecutionLogEntry, InstanceStatus, ScheduledTask, TaskPayload, TaskStatus,
    WorkflowInstance,
};
use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, Row};
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const WRITE_RETRY_ATTEMPTS: u32 = 3;
const WRITE_RETRY_BASE_MS: u64 = 25;
const WRITE_RETRY_CAP_MS: u64 = 200;

/// SQLite-backed store for engine execution state.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    pool: SqlitePool,
}

impl InstanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize instance, task, and log schemas.
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS). The partial unique
    /// index enforces the one-live-instance-per-account invariant at the
    /// storage layer as a backstop to the coordinator's own check.
    pub async fn init_schema(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_instances (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                workflow_type TEXT NOT NULL,
                definition_version INTEGER NOT NULL,
                current_step INTEGER NOT NULL DEFAULT 0,
                total_steps INTEGER NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                context JSON NOT NULL,
                next_task_id TEXT,
                next_action_at TIMESTAMP,
                started_at TIMESTAMP NOT NULL,
                paused_at TIMESTAMP,
                resumed_at TIMESTAMP,
                completed_at TIMESTAMP,
                failed_at TIMESTAMP,
                last_activity_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_account_live
            ON workflow_instances(account_id)
            WHERE status IN ('active', 'paused')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_instances_status ON workflow_instances(status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                account_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                due_at TIMESTAMP NOT NULL,
                payload JSON NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                attempt INTEGER NOT NULL DEFAULT 1,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_due ON scheduled_tasks(status, due_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_instance ON scheduled_tasks(instance_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                step_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                success INTEGER NOT NULL,
                result JSON,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_log_instance ON execution_log(instance_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // -- instances ----------------------------------------------------------

    /// Persist a fresh instance. A UNIQUE violation on the live-account
    /// index maps to `DuplicateActiveInstance`.
    pub async fn create_instance(&self, instance: &WorkflowInstance) -> EngineResult<()> {
        let context_json = serde_json::to_string(&instance.context)?;

        let result = self
            .with_write_retry("create_instance", || async {
                sqlx::query(
                    r#"
                    INSERT INTO workflow_instances (
                        id, account_id, workflow_type, definition_version,
                        current_step, total_steps, status, retry_count, last_error,
                        context, next_task_id, next_action_at,
                        started_at, paused_at, resumed_at, completed_at, failed_at,
                        last_activity_at
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(instance.id.to_string())
                .bind(&instance.account_id)
                .bind(&instance.workflow_type)
                .bind(instance.definition_version)
                .bind(instance.current_step as i64)
                .bind(instance.total_steps as i64)
                .bind(instance.status.to_string())
                .bind(instance.retry_count as i64)
                .bind(&instance.last_error)
                .bind(&context_json)
                .bind(instance.next_task_id.map(|id| id.to_string()))
                .bind(instance.next_action_at)
                .bind(instance.started_at)
                .bind(instance.paused_at)
                .bind(instance.resumed_at)
                .bind(instance.completed_at)
                .bind(instance.failed_at)
                .bind(instance.last_activity_at)
                .execute(&self.pool)
                .await
                .map(|_| ())
            })
            .await;

        match result {
            Err(EngineError::Store(err)) if is_unique_violation(&err) => {
                Err(EngineError::DuplicateActiveInstance {
                    account_id: instance.account_id.clone(),
                })
            }
            other => other,
        }
    }

    /// Rewrite an instance row. The caller holds the account guard, so a
    /// plain by-id update is a safe read-modify-write.
    pub async fn update_instance(&self, instance: &WorkflowInstance) -> EngineResult<()> {
        let context_json = serde_json::to_string(&instance.context)?;

        self.with_write_retry("update_instance", || async {
            sqlx::query(
                r#"
                UPDATE workflow_instances SET
                    current_step = ?, total_steps = ?, status = ?, retry_count = ?,
                    last_error = ?, context = ?, next_task_id = ?, next_action_at = ?,
                    paused_at = ?, resumed_at = ?, completed_at = ?, failed_at = ?,
                    last_activity_at = ?
                WHERE id = ?
                "#,
            )
            .bind(instance.current_step as i64)
            .bind(instance.total_steps as i64)
            .bind(instance.status.to_string())
            .bind(instance.retry_count as i64)
            .bind(&instance.last_error)
            .bind(&context_json)
            .bind(instance.next_task_id.map(|id| id.to_string()))
            .bind(instance.next_action_at)
            .bind(instance.paused_at)
            .bind(instance.resumed_at)
            .bind(instance.completed_at)
            .bind(instance.failed_at)
            .bind(instance.last_activity_at)
            .bind(instance.id.to_string())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn get_instance(&self, id: Uuid) -> EngineResult<Option<WorkflowInstance>> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_instance(&r)).transpose()
    }

    /// The account's live (active or paused) instance, if any.
    pub async fn get_live_instance(&self, account_id: &str) -> EngineResult<Option<WorkflowInstance>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_instances
            WHERE account_id = ? AND status IN ('active', 'paused')
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_instance(&r)).transpose()
    }

    /// The account's most recent instance regardless of status. Terminal
    /// instances stay queryable with their last error until cleaned up.
    pub async fn get_latest_instance(
        &self,
        account_id: &str,
    ) -> EngineResult<Option<WorkflowInstance>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM workflow_instances
            WHERE account_id = ?
            ORDER BY started_at DESC LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_instance(&r)).transpose()
    }

    pub async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> EngineResult<Vec<WorkflowInstance>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_instances WHERE status = ? ORDER BY started_at",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_instance).collect()
    }

    /// All live (active or paused) instances.
    pub async fn list_live(&self) -> EngineResult<Vec<WorkflowInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM workflow_instances
            WHERE status IN ('active', 'paused')
            ORDER BY started_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_instance).collect()
    }

    // -- scheduled tasks ----------------------------------------------------

    pub async fn create_task(&self, task: &ScheduledTask) -> EngineResult<()> {
        let payload_json = serde_json::to_string(&task.payload)?;

        self.with_write_retry("create_task", || async {
            sqlx::query(
                r#"
                INSERT INTO scheduled_tasks (
                    id, instance_id, account_id, step_id, kind, due_at, payload,
                    status, attempt, max_attempts, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(task.id.to_string())
            .bind(task.instance_id.to_string())
            .bind(&task.account_id)
            .bind(&task.step_id)
            .bind(task.kind.to_string())
            .bind(task.due_at)
            .bind(&payload_json)
            .bind(task.status.to_string())
            .bind(task.attempt as i64)
            .bind(task.max_attempts as i64)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn get_task(&self, id: Uuid) -> EngineResult<Option<ScheduledTask>> {
        let row = sqlx::query("SELECT * FROM scheduled_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_task(&r)).transpose()
    }

    /// Atomically consume a task that is still `scheduled`. Returns false
    /// when the task was already consumed, cancelled, or superseded — the
    /// caller must then treat the firing as a no-op. This is what makes a
    /// task fire at most once per scheduling.
    pub async fn claim_task(&self, id: Uuid) -> EngineResult<bool> {
        let affected = self
            .with_write_retry("claim_task", || async {
                sqlx::query(
                    r#"
                    UPDATE scheduled_tasks SET status = 'completed', updated_at = ?
                    WHERE id = ? AND status = 'scheduled'
                    "#,
                )
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected == 1)
    }

    /// Flip an already-claimed task to `failed` so the audit trail reflects
    /// the outcome.
    pub async fn mark_task_failed(&self, id: Uuid) -> EngineResult<()> {
        self.with_write_retry("mark_task_failed", || async {
            sqlx::query("UPDATE scheduled_tasks SET status = 'failed', updated_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Cancel a task that has not fired yet. Returns true if it was still
    /// `scheduled`.
    pub async fn cancel_task(&self, id: Uuid) -> EngineResult<bool> {
        let affected = self
            .with_write_retry("cancel_task", || async {
                sqlx::query(
                    r#"
                    UPDATE scheduled_tasks SET status = 'cancelled', updated_at = ?
                    WHERE id = ? AND status = 'scheduled'
                    "#,
                )
                .bind(Utc::now())
                .bind(id.to_string())
                .execute(&self.pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected == 1)
    }

    /// Cancel every pending task of an instance (terminal transitions,
    /// stop). Returns how many were cancelled.
    pub async fn cancel_tasks_for_instance(&self, instance_id: Uuid) -> EngineResult<u64> {
        self.with_write_retry("cancel_tasks_for_instance", || async {
            sqlx::query(
                r#"
                UPDATE scheduled_tasks SET status = 'cancelled', updated_at = ?
                WHERE instance_id = ? AND status = 'scheduled'
                "#,
            )
            .bind(Utc::now())
            .bind(instance_id.to_string())
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await
    }

    /// Pull a pending task's due time forward (resume of an instance whose
    /// task elapsed while paused).
    pub async fn reset_task_due(&self, id: Uuid, due_at: DateTime<Utc>) -> EngineResult<()> {
        self.with_write_retry("reset_task_due", || async {
            sqlx::query(
                r#"
                UPDATE scheduled_tasks SET due_at = ?, updated_at = ?
                WHERE id = ? AND status = 'scheduled'
                "#,
            )
            .bind(due_at)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// Due tasks ready to fire: still `scheduled`, due at or before `now`,
    /// and owned by an *active* instance. Paused instances make their tasks
    /// inert simply by dropping out of this query.
    pub async fn fetch_due_tasks(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            r#"
            SELECT t.* FROM scheduled_tasks t
            JOIN workflow_instances i ON i.id = t.instance_id
            WHERE t.status = 'scheduled' AND t.due_at <= ? AND i.status = 'active'
            ORDER BY t.due_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Pending tasks of one instance, oldest first.
    pub async fn list_scheduled_tasks(&self, instance_id: Uuid) -> EngineResult<Vec<ScheduledTask>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduled_tasks
            WHERE instance_id = ? AND status = 'scheduled'
            ORDER BY due_at ASC
            "#,
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }

    /// Cancel tasks still scheduled for instances that are already
    /// terminal (left behind by a crash mid-transition).
    pub async fn cancel_orphaned_tasks(&self) -> EngineResult<u64> {
        self.with_write_retry("cancel_orphaned_tasks", || async {
            sqlx::query(
                r#"
                UPDATE scheduled_tasks SET status = 'cancelled', updated_at = ?
                WHERE status = 'scheduled' AND instance_id IN (
                    SELECT id FROM workflow_instances
                    WHERE status IN ('stopped', 'completed', 'failed')
                )
                "#,
            )
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await
    }

    // -- execution log ------------------------------------------------------

    pub async fn append_log(&self, entry: &ExecutionLogEntry) -> EngineResult<()> {
        let result_json = entry
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_write_retry("append_log", || async {
            sqlx::query(
                r#"
                INSERT INTO execution_log (
                    instance_id, step_id, step_index, kind, success,
                    result, error, duration_ms, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.instance_id.to_string())
            .bind(&entry.step_id)
            .bind(entry.step_index as i64)
            .bind(entry.kind.to_string())
            .bind(entry.success)
            .bind(&result_json)
            .bind(&entry.error)
            .bind(entry.duration_ms)
            .bind(entry.created_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    pub async fn list_log(
        &self,
        instance_id: Uuid,
        limit: i64,
    ) -> EngineResult<Vec<ExecutionLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_log
            WHERE instance_id = ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(instance_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_log_entry).collect()
    }

    // -- statistics ---------------------------------------------------------

    pub async fn statistics(&self) -> EngineResult<EngineStatistics> {
        let rows =
            sqlx::query("SELECT status, COUNT(*) AS n FROM workflow_instances GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for row in rows {
            counts.insert(row.get("status"), row.get("n"));
        }

        let scheduled_tasks: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM scheduled_tasks WHERE status = 'scheduled'")
                .fetch_one(&self.pool)
                .await?
                .get("n");
        let executed_steps: i64 = sqlx::query("SELECT COUNT(*) AS n FROM execution_log")
            .fetch_one(&self.pool)
            .await?
            .get("n");

        Ok(EngineStatistics {
            active: counts.get("active").copied().unwrap_or(0),
            paused: counts.get("paused").copied().unwrap_or(0),
            stopped: counts.get("stopped").copied().unwrap_or(0),
            completed: counts.get("completed").copied().unwrap_or(0),
            failed: counts.get("failed").copied().unwrap_or(0),
            scheduled_tasks,
            executed_steps,
        })
    }

    // -- write retry --------------------------------------------------------

    /// Run one mutating statement, retrying on transient busy/locked errors
    /// with bounded backoff. Exhausted retries surface as `StoreConflict`.
    async fn with_write_retry<T, F, Fut>(&self, op_name: &str, op: F) -> EngineResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_busy_error(&err) && attempt < WRITE_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay =
                        backoff_delay_ms(WRITE_RETRY_BASE_MS, WRITE_RETRY_CAP_MS, attempt);
                    tracing::warn!(
                        "🔁 {op_name}: database busy, retrying in {delay}ms (attempt {attempt})"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) if is_busy_error(&err) => {
                    return Err(EngineError::StoreConflict {
                        message: format!("{op_name}: {err}"),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn is_busy_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked")
                || message.contains("database table is locked")
                || message.contains("busy")
        }
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed"))
}

fn parse_uuid(raw: String) -> EngineResult<Uuid> {
    Uuid::parse_str(&raw)
        .map_err(|e| EngineError::StoreConflict { message: format!("bad uuid in store: {e}") })
}

fn row_to_instance(row: &SqliteRow) -> EngineResult<WorkflowInstance> {
    let status: String = row.get("status");
    let context_json: String = row.get("context");
    let next_task_id: Option<String> = row.get("next_task_id");

    Ok(WorkflowInstance {
        id: parse_uuid(row.get("id"))?,
        account_id: row.get("account_id"),
        workflow_type: row.get("workflow_type"),
        definition_version: row.get("definition_version"),
        current_step: row.get::<i64, _>("current_step") as usize,
        total_steps: row.get::<i64, _>("total_steps") as usize,
        status: InstanceStatus::from_str(&status)
            .map_err(|e| EngineError::StoreConflict { message: e })?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        last_error: row.get("last_error"),
        context: serde_json::from_str(&context_json)?,
        next_task_id: next_task_id.map(parse_uuid).transpose()?,
        next_action_at: row.get("next_action_at"),
        started_at: row.get("started_at"),
        paused_at: row.get("paused_at"),
        resumed_at: row.get("resumed_at"),
        completed_at: row.get("completed_at"),
        failed_at: row.get("failed_at"),
        last_activity_at: row.get("last_activity_at"),
    })
}

fn row_to_task(row: &SqliteRow) -> EngineResult<ScheduledTask> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let payload_json: String = row.get("payload");
    let payload: TaskPayload = serde_json::from_str(&payload_json)?;

    Ok(ScheduledTask {
        id: parse_uuid(row.get("id"))?,
        instance_id: parse_uuid(row.get("instance_id"))?,
        account_id: row.get("account_id"),
        step_id: row.get("step_id"),
        kind: kind
            .parse()
            .map_err(|e: String| EngineError::StoreConflict { message: e })?,
        due_at: row.get("due_at"),
        payload,
        status: TaskStatus::from_str(&status)
            .map_err(|e| EngineError::StoreConflict { message: e })?,
        attempt: row.get::<i64, _>("attempt") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_log_entry(row: &SqliteRow) -> EngineResult<ExecutionLogEntry> {
    let kind: String = row.get("kind");
    let result_json: Option<String> = row.get("result");

    Ok(ExecutionLogEntry {
        instance_id: parse_uuid(row.get("instance_id"))?,
        step_id: row.get("step_id"),
        step_index: row.get::<i64, _>("step_index") as usize,
        kind: kind
            .parse()
            .map_err(|e: String| EngineError::StoreConflict { message: e })?,
        success: row.get("success"),
        result: result_json.map(|s| serde_json::from_str(&s)).transpose()?,
        error: row.get("error"),
        duration_ms: row.get("duration_ms"),
        created_at: row.get("created_at"),
    })
}
