//! Lifecycle notifications as explicit message passing.
//!
//! The coordinator publishes milestones to an injected sink instead of an
//! implicit event bus, so hosts can forward them to chat, metrics, or a
//! dashboard feed. The default sink writes structured log lines.

use crate::engine::types::WorkflowInstance;
use serde_json::Value;

/// Receives coordinator milestones. Implementations should return quickly;
/// anything slow belongs on the far side of a channel.
pub trait NotificationSink: Send + Sync {
    fn on_started(&self, instance: &WorkflowInstance);
    fn on_step_completed(&self, instance: &WorkflowInstance, step_id: &str, result: &Value);
    fn on_completed(&self, instance: &WorkflowInstance);
    fn on_failed(&self, instance: &WorkflowInstance, error: &str);
}

/// Default sink: structured tracing output.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn on_started(&self, instance: &WorkflowInstance) {
        tracing::info!(
            "🚀 Instance {} started for account {} ({} v{}, {} steps)",
            instance.id,
            instance.account_id,
            instance.workflow_type,
            instance.definition_version,
            instance.total_steps
        );
    }

    fn on_step_completed(&self, instance: &WorkflowInstance, step_id: &str, _result: &Value) {
        tracing::info!(
            "✅ Account {}: step '{}' completed ({}/{})",
            instance.account_id,
            step_id,
            instance.current_step,
            instance.total_steps
        );
    }

    fn on_completed(&self, instance: &WorkflowInstance) {
        tracing::info!(
            "🎉 Account {}: workflow '{}' completed",
            instance.account_id,
            instance.workflow_type
        );
    }

    fn on_failed(&self, instance: &WorkflowInstance, error: &str) {
        tracing::error!(
            "❌ Account {}: workflow '{}' failed: {error}",
            instance.account_id,
            instance.workflow_type
        );
    }
}
