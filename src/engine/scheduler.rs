//! Durable step scheduling.
//!
//! Scheduling never executes anything — it persists a due-time-ordered
//! task record and returns. The poller (see [`crate::runtime::poller`])
//! later asks the store for tasks whose due time has passed and hands each
//! one to `Coordinator::advance`. Rescheduling always mints a new task id;
//! a superseded task still pending is cancelled first so it can never fire
//! alongside its replacement.

use crate::engine::store::InstanceStore;
use crate::engine::types::{ScheduledTask, TaskPayload, TaskStatus};
use crate::error::EngineResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Persists future work as durable task rows.
#[derive(Debug)]
pub struct StepScheduler {
    store: Arc<InstanceStore>,
}

impl StepScheduler {
    pub fn new(store: Arc<InstanceStore>) -> Self {
        Self { store }
    }

    /// Persist a task due at `due_at`. A fresh task id is minted and
    /// written back into the payload before it is stored.
    pub async fn schedule(
        &self,
        mut payload: TaskPayload,
        due_at: DateTime<Utc>,
    ) -> EngineResult<Uuid> {
        let task_id = Uuid::new_v4();
        payload.task_id = task_id;

        let now = Utc::now();
        let task = ScheduledTask {
            id: task_id,
            instance_id: payload.instance_id,
            account_id: payload.account_id.clone(),
            step_id: payload.step_id.clone(),
            kind: payload.kind,
            due_at,
            status: TaskStatus::Scheduled,
            attempt: payload.attempt,
            max_attempts: payload.max_attempts,
            created_at: now,
            updated_at: now,
            payload,
        };
        self.store.create_task(&task).await?;

        tracing::debug!(
            "🗓️ Scheduled step '{}' for instance {} at {due_at} (attempt {})",
            task.step_id,
            task.instance_id,
            task.attempt
        );

        Ok(task_id)
    }

    /// Cancel a superseded task (if it is still pending), then schedule its
    /// replacement. Keeps the one-pending-main-task invariant.
    pub async fn schedule_replacing(
        &self,
        superseded: Option<Uuid>,
        payload: TaskPayload,
        due_at: DateTime<Utc>,
    ) -> EngineResult<Uuid> {
        if let Some(old_id) = superseded {
            if self.store.cancel_task(old_id).await? {
                tracing::debug!("🛑 Cancelled superseded task {old_id}");
            }
        }
        self.schedule(payload, due_at).await
    }

    /// Cancel a pending task. Returns true if it was still scheduled.
    pub async fn cancel(&self, task_id: Uuid) -> EngineResult<bool> {
        self.store.cancel_task(task_id).await
    }
}
