//! Warmway: durable account lifecycle automation engine.
//!
//! Turns a declarative step list into a durable, resumable, retryable
//! sequence of scheduled actions per account: goto loops, independently
//! timed parallel side branches, a self-perpetuating recurring-action
//! chain, exponential-backoff retry, and startup recovery of in-flight
//! work.

// Core configuration and setup
pub mod config;

// Engine error taxonomy
pub mod error;

// Workflow management layer - definitions, versioned storage, registry
pub mod workflow;

// Execution engine - coordinator, scheduler, store, guard, recovery
pub mod engine;

// Background runtime services - due-task poller
pub mod runtime;

// HTTP API layer - definition CRUD and the instance control surface
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use engine::{
    ActionDispatcher, ActionRequest, ExecutionCoordinator, InstanceStatus, InstanceView,
    NotificationSink, RecoveryManager, StepScheduler,
};
pub use error::{EngineError, EngineResult};
pub use server::start_server;
pub use workflow::{StepKind, StepSpec, WorkflowDefinition};
