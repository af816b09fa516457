//! The workflow execution engine.
//!
//! Components are wired together by dependency injection in
//! [`crate::server`]: the coordinator drives instances, the scheduler
//! persists future work, the store is the single source of truth, the
//! guard serializes per-account mutations, and the recovery manager
//! reconciles everything once at startup.

pub mod coordinator;
pub mod dispatcher;
pub mod guard;
pub mod notify;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use coordinator::ExecutionCoordinator;
pub use dispatcher::{ActionDispatcher, ActionRequest, HttpActionDispatcher, LoggingDispatcher};
pub use guard::AccountGuard;
pub use notify::{LogSink, NotificationSink};
pub use recovery::RecoveryManager;
pub use scheduler::StepScheduler;
pub use store::InstanceStore;
pub use types::{
    EngineStatistics, ExecutionLogEntry, InstanceStatus, InstanceView, RecoveryReport,
    ScheduledTask, TaskPayload, TaskStatus, WorkflowInstance,
};
