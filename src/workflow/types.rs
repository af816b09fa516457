//! Core workflow definition types.
//!
//! A definition is an immutable, versioned template: an ordered step list
//! plus a retry policy. Definitions are serialized to JSON for persistence
//! and validated before they are accepted into storage.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Current definition schema version, stored alongside every definition.
pub const SCHEMA_VERSION: u32 = 1;

/// A complete lifecycle workflow definition.
///
/// The step list is the whole program: main-sequence steps run in order
/// (with explicit `goto` jumps), `parallel` steps are independently timed
/// side branches measured from instance start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique definition key (e.g., "standard-warmup")
    pub workflow_type: String,
    /// Human-readable name
    pub name: String,
    /// Version assigned by storage; bumped on every save
    #[serde(default)]
    pub version: i64,
    /// Definition schema version for forward compatibility
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Ordered list of steps
    pub steps: Vec<StepSpec>,
    /// Retry policy applied to every step of this definition
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// One element of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique step identifier within the definition (e.g., "first-post")
    pub id: String,
    /// The kind of step, which determines execution behavior
    pub kind: StepKind,
    /// Delay before execution in milliseconds. For main-sequence steps the
    /// delay is measured from the previous step; for `parallel` steps it is
    /// measured from instance start.
    #[serde(default)]
    pub delay_ms: u64,
    /// Failure of a critical step (after retries) fails the whole instance;
    /// a non-critical failure is skipped once retries exhaust.
    #[serde(default)]
    pub critical: bool,
    /// Parallel steps are scheduled eagerly at instance start and never
    /// block or advance the main sequence.
    #[serde(default)]
    pub parallel: bool,
    /// Per-step timeout override, capped by the definition-level timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Kind-specific parameters as flexible JSON
    #[serde(default)]
    pub params: Value,
}

/// Available step kinds.
///
/// A closed set matched exhaustively by the coordinator — an unknown kind
/// is a deserialization error, never a silently ignored step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Pure delay; succeeds as soon as its due time fires
    Wait,
    /// Generate profile text and apply it to the account bio
    /// Expected params: { "tone": "casual", "max_len": 160, ... }
    GenerateBio,
    /// Generate post text and publish it on the account
    /// Expected params: { "topic_pool": [...], ... }
    GeneratePost,
    /// Perform a batch of platform actions for the account
    /// Expected params: { "action": "follow", "count": 12, ... }
    BatchAction,
    /// Arm the self-perpetuating recurring-action chain
    /// Expected params: see [`RecurringParams`]
    RecurringAction,
    /// Explicit jump to another step id, used to construct loops
    /// Expected params: see [`GotoParams`]
    Goto,
}

impl StepKind {
    /// Default dispatch timeout per kind, in milliseconds. Overridable per
    /// step, capped by the definition-level timeout.
    pub fn default_timeout_ms(&self) -> u64 {
        match self {
            StepKind::Wait | StepKind::Goto => 5_000,
            StepKind::GenerateBio | StepKind::GeneratePost => 30_000,
            StepKind::BatchAction | StepKind::RecurringAction => 60_000,
        }
    }

    /// Whether the kind reaches the action dispatcher at all. Wait and goto
    /// are resolved inside the coordinator.
    pub fn is_dispatched(&self) -> bool {
        !matches!(self, StepKind::Wait | StepKind::Goto)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepKind::Wait => "wait",
            StepKind::GenerateBio => "generate_bio",
            StepKind::GeneratePost => "generate_post",
            StepKind::BatchAction => "batch_action",
            StepKind::RecurringAction => "recurring_action",
            StepKind::Goto => "goto",
        };
        write!(f, "{s}")
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(StepKind::Wait),
            "generate_bio" => Ok(StepKind::GenerateBio),
            "generate_post" => Ok(StepKind::GeneratePost),
            "batch_action" => Ok(StepKind::BatchAction),
            "recurring_action" => Ok(StepKind::RecurringAction),
            "goto" => Ok(StepKind::Goto),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Retry policy applied to every step of a definition.
///
/// Backoff for attempt n is `min(base_backoff_ms * 2^(n-1), max_backoff_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per step (first execution included)
    pub max_attempts: u32,
    /// Base backoff between retries in milliseconds
    pub base_backoff_ms: u64,
    /// Backoff cap in milliseconds
    pub max_backoff_ms: u64,
    /// Definition-level step timeout: the default and the ceiling for
    /// per-step overrides
    pub step_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 5_000,
            max_backoff_ms: 300_000,
            step_timeout_ms: 60_000,
        }
    }
}

/// Parameters of a `goto` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GotoParams {
    /// Target step id within the same definition
    pub target: String,
    /// Maximum traversals of this edge; engine default applies when unset
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Opt out of the iteration limit entirely
    #[serde(default)]
    pub unbounded: bool,
}

/// Parameters of a `recurring_action` step.
///
/// Each firing draws a magnitude in `[min_amount, max_amount]` and, after
/// completing, reschedules itself after a random delay in
/// `[min_interval_ms, max_interval_ms]` — or `failure_interval_ms` when the
/// firing failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringParams {
    pub min_amount: i64,
    pub max_amount: i64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Fallback reschedule delay after a failed firing
    #[serde(default = "default_failure_interval")]
    pub failure_interval_ms: u64,
    /// Free-form action parameters forwarded to the dispatcher
    #[serde(default)]
    pub action: Value,
}

fn default_failure_interval() -> u64 {
    600_000
}

impl WorkflowDefinition {
    /// Validate the definition's structure.
    ///
    /// Checks: non-empty step list, unique step ids, at least one
    /// non-parallel step (the main cursor needs something to run), goto
    /// targets resolve within the definition, kind-specific params parse,
    /// recurring bounds are ordered.
    pub fn validate(&self) -> EngineResult<()> {
        if self.workflow_type.is_empty() {
            return Err(EngineError::Validation("workflow_type is empty".into()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::Validation("definition has no steps".into()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(EngineError::Validation("step with empty id".into()));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        if self.steps.iter().all(|s| s.parallel) {
            return Err(EngineError::Validation(
                "definition needs at least one non-parallel step".into(),
            ));
        }

        for step in &self.steps {
            match step.kind {
                StepKind::Goto => {
                    let params = step.goto_params()?;
                    if self.step_index(&params.target).is_none() {
                        return Err(EngineError::Validation(format!(
                            "goto step '{}' targets unknown step '{}'",
                            step.id, params.target
                        )));
                    }
                    if step.parallel {
                        return Err(EngineError::Validation(format!(
                            "goto step '{}' cannot be parallel",
                            step.id
                        )));
                    }
                }
                StepKind::RecurringAction => {
                    let params = step.recurring_params()?;
                    if params.min_amount > params.max_amount {
                        return Err(EngineError::Validation(format!(
                            "recurring step '{}': min_amount > max_amount",
                            step.id
                        )));
                    }
                    if params.min_interval_ms > params.max_interval_ms {
                        return Err(EngineError::Validation(format!(
                            "recurring step '{}': min_interval_ms > max_interval_ms",
                            step.id
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Resolve a step id to its index in the step list.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// First non-parallel step index at or after `from`. Parallel steps are
    /// side branches; the main cursor walks past them.
    pub fn next_main_step(&self, from: usize) -> Option<usize> {
        (from..self.steps.len()).find(|&i| !self.steps[i].parallel)
    }
}

impl StepSpec {
    /// Parse this step's params as [`GotoParams`].
    pub fn goto_params(&self) -> EngineResult<GotoParams> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            EngineError::Validation(format!("step '{}': bad goto params: {e}", self.id))
        })
    }

    /// Parse this step's params as [`RecurringParams`].
    pub fn recurring_params(&self) -> EngineResult<RecurringParams> {
        serde_json::from_value(self.params.clone()).map_err(|e| {
            EngineError::Validation(format!("step '{}': bad recurring params: {e}", self.id))
        })
    }

    /// Effective dispatch timeout: per-step override (or kind default),
    /// capped by the definition-level timeout.
    pub fn effective_timeout_ms(&self, policy: &RetryPolicy) -> u64 {
        self.timeout_ms
            .unwrap_or_else(|| self.kind.default_timeout_ms())
            .min(policy.step_timeout_ms)
    }
}
