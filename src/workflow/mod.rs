//! Workflow management layer.
//!
//! Definitions, their versioned SQLite persistence, and the hot-reload
//! registry the engine reads from.

pub mod registry;
pub mod storage;
pub mod types;

pub use registry::DefinitionRegistry;
pub use storage::{DefinitionMetadata, DefinitionStorage};
pub use types::{
    GotoParams, RecurringParams, RetryPolicy, StepKind, StepSpec, WorkflowDefinition,
};
