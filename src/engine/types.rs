//! Engine data model: instances, scheduled tasks, and the execution log.
//!
//! These types mirror the SQLite rows in [`crate::engine::store`] and are
//! serialized to JSON where the schema keeps flexible columns (context,
//! task payload).

use crate::workflow::types::StepKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a workflow instance.
///
/// Exactly five values; `stopped`, `completed` and `failed` are terminal
/// and entered at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Stopped | InstanceStatus::Completed | InstanceStatus::Failed
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InstanceStatus::Active),
            "paused" => Ok(InstanceStatus::Paused),
            "stopped" => Ok(InstanceStatus::Stopped),
            "completed" => Ok(InstanceStatus::Completed),
            "failed" => Ok(InstanceStatus::Failed),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// One account's running (or terminal) copy of a workflow definition.
///
/// The store row is the source of truth; in-memory values of this struct
/// are always reconstructed from it under the account guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    /// Unique among non-terminal instances (partial unique index)
    pub account_id: String,
    pub workflow_type: String,
    /// Definition version this instance is pinned to
    pub definition_version: i64,
    /// Index of the next main-sequence step to run
    pub current_step: usize,
    pub total_steps: usize,
    pub status: InstanceStatus,
    /// Retry attempts spent on the current step
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Execution context: account context, step results, goto iteration
    /// counters (keyed `"<from>_to_<to>"`), parallel completion markers,
    /// recurring-action handles
    pub context: HashMap<String, Value>,
    /// The pending main-sequence task, if any
    pub next_task_id: Option<Uuid>,
    pub next_action_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Create a fresh instance at step 0 for an account.
    pub fn new(
        account_id: String,
        workflow_type: String,
        definition_version: i64,
        total_steps: usize,
        context: HashMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id,
            workflow_type,
            definition_version,
            current_step: 0,
            total_steps,
            status: InstanceStatus::Active,
            retry_count: 0,
            last_error: None,
            context,
            next_task_id: None,
            next_action_at: None,
            started_at: now,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            failed_at: None,
            last_activity_at: now,
        }
    }

    /// Context key for a goto edge, `"<from>_to_<to>"`.
    pub fn goto_edge_key(from: &str, to: &str) -> String {
        format!("{from}_to_{to}")
    }

    /// How many times a goto edge has fired so far.
    pub fn goto_count(&self, edge: &str) -> u32 {
        self.context
            .get(edge)
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }

    /// Record one more traversal of a goto edge.
    pub fn record_goto(&mut self, edge: &str) {
        let next = self.goto_count(edge) + 1;
        self.context.insert(edge.to_string(), Value::from(next));
    }
}

/// Status of a durable scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Opaque payload carried by a scheduled task and handed to
/// `Coordinator::advance` when the task fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Id of the task row carrying this payload
    pub task_id: Uuid,
    pub instance_id: Uuid,
    pub account_id: String,
    pub step_id: String,
    pub step_index: usize,
    pub kind: StepKind,
    /// Side-branch firing: never moves the main cursor
    #[serde(default)]
    pub parallel: bool,
    /// Recurring-chain firing (as opposed to the activation step)
    #[serde(default)]
    pub recurring: bool,
    /// 1-based attempt number for this step
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    pub max_attempts: u32,
    /// Step parameters snapshot
    #[serde(default)]
    pub params: Value,
}

fn default_attempt() -> u32 {
    1
}

/// A durable, due-time-ordered unit of future work.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub account_id: String,
    pub step_id: String,
    pub kind: StepKind,
    pub due_at: DateTime<Utc>,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// The payload to hand to `advance`, with row-level fields (task id,
    /// attempt counters) taking precedence over the stored snapshot.
    pub fn advance_payload(&self) -> TaskPayload {
        let mut payload = self.payload.clone();
        payload.task_id = self.id;
        payload.attempt = self.attempt;
        payload.max_attempts = self.max_attempts;
        payload
    }
}

/// Append-only audit record for one executed step attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLogEntry {
    pub instance_id: Uuid,
    pub step_id: String,
    pub step_index: usize,
    pub kind: StepKind,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Read-only instance snapshot returned by `status` and `list_active`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub instance_id: Uuid,
    pub account_id: String,
    pub workflow_type: String,
    pub definition_version: i64,
    pub status: InstanceStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_action_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl From<&WorkflowInstance> for InstanceView {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            account_id: instance.account_id.clone(),
            workflow_type: instance.workflow_type.clone(),
            definition_version: instance.definition_version,
            status: instance.status,
            current_step: instance.current_step,
            total_steps: instance.total_steps,
            retry_count: instance.retry_count,
            last_error: instance.last_error.clone(),
            next_action_at: instance.next_action_at,
            started_at: instance.started_at,
            last_activity_at: instance.last_activity_at,
        }
    }
}

/// Aggregate counters for the operator dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatistics {
    pub active: i64,
    pub paused: i64,
    pub stopped: i64,
    pub completed: i64,
    pub failed: i64,
    pub scheduled_tasks: i64,
    pub executed_steps: i64,
}

/// Outcome of startup recovery.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecoveryReport {
    pub recovered: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goto_counters_accumulate_per_edge() {
        let mut instance = WorkflowInstance::new(
            "acct-1".into(),
            "warmup".into(),
            1,
            3,
            HashMap::new(),
        );
        let edge = WorkflowInstance::goto_edge_key("b", "a");
        assert_eq!(edge, "b_to_a");
        assert_eq!(instance.goto_count(&edge), 0);
        instance.record_goto(&edge);
        instance.record_goto(&edge);
        assert_eq!(instance.goto_count(&edge), 2);
        assert_eq!(instance.goto_count("other_to_edge"), 0);
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(!InstanceStatus::Active.is_terminal());
        assert!(!InstanceStatus::Paused.is_terminal());
        assert!(InstanceStatus::Stopped.is_terminal());
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
    }

    #[test]
    fn advance_payload_prefers_row_fields() {
        let payload = TaskPayload {
            task_id: Uuid::nil(),
            instance_id: Uuid::new_v4(),
            account_id: "acct-1".into(),
            step_id: "a".into(),
            step_index: 0,
            kind: StepKind::Wait,
            parallel: false,
            recurring: false,
            attempt: 1,
            max_attempts: 3,
            params: Value::Null,
        };
        let task = ScheduledTask {
            id: Uuid::new_v4(),
            instance_id: payload.instance_id,
            account_id: payload.account_id.clone(),
            step_id: payload.step_id.clone(),
            kind: payload.kind,
            due_at: Utc::now(),
            payload,
            status: TaskStatus::Scheduled,
            attempt: 2,
            max_attempts: 3,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let advanced = task.advance_payload();
        assert_eq!(advanced.task_id, task.id);
        assert_eq!(advanced.attempt, 2);
    }
}
