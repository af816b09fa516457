//! Action dispatch: the boundary where steps touch the outside world.
//!
//! The engine only knows the [`ActionDispatcher`] trait; the host supplies
//! the implementation. Two are provided here: an HTTP dispatcher that
//! forwards actions to an automation-platform endpoint, and a logging
//! no-op used for local development. Because recovery gives at-least-once
//! semantics for the step in flight at crash time, implementations must be
//! idempotent or safely re-appliable.

use crate::workflow::types::StepKind;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// One step's side effect, as handed to the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct ActionRequest {
    pub account_id: String,
    pub step_id: String,
    pub kind: StepKind,
    /// Step parameters from the definition (or the recurring action body)
    pub params: Value,
    /// Randomized magnitude for recurring-action firings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    /// Execution context snapshot (account context + prior step results)
    pub context: HashMap<String, Value>,
}

/// Executes one step's side effect and returns its result payload.
///
/// Implementations must respect the caller-supplied timeout budget: the
/// coordinator additionally wraps every call in `tokio::time::timeout`, so
/// an overrunning action is treated as failed either way.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn execute(&self, request: ActionRequest) -> anyhow::Result<Value>;
}

/// Production dispatcher: POSTs each action to the automation platform and
/// returns the response body as the step result.
#[derive(Debug)]
pub struct HttpActionDispatcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpActionDispatcher {
    pub fn new(endpoint: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl ActionDispatcher for HttpActionDispatcher {
    async fn execute(&self, request: ActionRequest) -> anyhow::Result<Value> {
        tracing::debug!(
            "📡 Dispatching '{}' action for account {} to {}",
            request.kind,
            request.account_id,
            self.endpoint
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("automation platform returned {status}: {body}");
        }

        let result: Value = response.json().await?;
        Ok(result)
    }
}

/// Development dispatcher: logs the action and reports success without
/// touching anything.
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl ActionDispatcher for LoggingDispatcher {
    async fn execute(&self, request: ActionRequest) -> anyhow::Result<Value> {
        tracing::info!(
            "🧪 [dry-run] {} '{}' for account {} (amount: {:?})",
            request.kind,
            request.step_id,
            request.account_id,
            request.amount
        );
        Ok(serde_json::json!({
            "dry_run": true,
            "kind": request.kind.to_string(),
            "step_id": request.step_id,
        }))
    }
}
