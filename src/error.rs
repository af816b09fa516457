//! Engine error taxonomy.
//!
//! Every fallible engine operation returns [`EngineResult`]. Transient
//! storage/lock errors (`StoreConflict`, `LockTimeout`) are retried
//! internally with bounded backoff and only surface once retries exhaust;
//! everything else maps onto a caller-visible outcome (HTTP status,
//! terminal instance state, or log entry).

use thiserror::Error;

/// Errors produced by the workflow engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An active or paused instance already exists for this account.
    #[error("account '{account_id}' already has an active or paused instance")]
    DuplicateActiveInstance { account_id: String },

    /// The requested control operation is not valid for the instance's
    /// current status (e.g. resume on an active instance).
    #[error("cannot {operation} instance in status '{status}'")]
    InvalidStateTransition { operation: String, status: String },

    /// The definition (or the exact version an instance is pinned to)
    /// no longer exists in storage.
    #[error("workflow definition '{workflow_type}' v{version} not found")]
    DefinitionMissing { workflow_type: String, version: i64 },

    /// No instance exists for the given account.
    #[error("no workflow instance found for account '{account_id}'")]
    InstanceNotFound { account_id: String },

    /// A dispatched step action did not return within its bounded timeout.
    #[error("step '{step_id}' timed out after {timeout_ms}ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    /// A goto edge was traversed more times than its configured maximum.
    #[error("goto edge '{edge}' exceeded its iteration limit of {limit}")]
    GotoLimitExceeded { edge: String, limit: u32 },

    /// The action dispatcher reported a failure for a step.
    #[error("action for step '{step_id}' failed: {message}")]
    ActionFailed { step_id: String, message: String },

    /// A storage write kept conflicting (busy/locked) past the bounded
    /// internal retry budget.
    #[error("storage conflict persisted after retries: {message}")]
    StoreConflict { message: String },

    /// The per-account guard could not be acquired within its bounded wait.
    #[error("timed out acquiring the account lock for '{account_id}'")]
    LockTimeout { account_id: String },

    /// A workflow definition failed structural validation.
    #[error("invalid workflow definition: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
