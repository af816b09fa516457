//! Instance control surface REST API.
//!
//! Maps 1:1 onto the coordinator contract: start, pause, resume, stop,
//! status, list, execution log, and engine statistics.

use crate::engine::coordinator::ExecutionCoordinator;
use crate::engine::store::InstanceStore;
use crate::engine::types::{EngineStatistics, InstanceView};
use crate::runtime::poller::TaskPoller;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Shared state for instance routes.
///
/// Also owns the background poller so the sweep job lives exactly as long
/// as the application that serves these routes.
#[derive(Clone)]
pub struct EngineAppState {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub store: Arc<InstanceStore>,
    pub poller: Arc<TaskPoller>,
}

/// Request body for instance start.
#[derive(Debug, Deserialize)]
pub struct StartInstanceRequest {
    pub account_id: String,
    pub workflow_type: String,
    /// Initial account context carried through every step
    #[serde(default)]
    pub context: HashMap<String, Value>,
}

/// Response for instance start.
#[derive(Debug, Serialize)]
pub struct StartInstanceResponse {
    pub instance_id: Uuid,
    pub message: String,
}

/// Create instance control routes.
pub fn create_instance_routes() -> Router<EngineAppState> {
    Router::new()
        .route("/api/instances", post(start_instance))
        .route("/api/instances", get(list_active))
        .route("/api/instances/{account_id}", get(instance_status))
        .route("/api/instances/{account_id}/pause", post(pause_instance))
        .route("/api/instances/{account_id}/resume", post(resume_instance))
        .route("/api/instances/{account_id}/stop", post(stop_instance))
        .route("/api/instances/{account_id}/log", get(instance_log))
        .route("/api/stats", get(statistics))
}

/// Start a workflow instance for an account.
///
/// POST /api/instances
/// Body: { "account_id": "...", "workflow_type": "...", "context": {...} }
async fn start_instance(
    State(state): State<EngineAppState>,
    Json(payload): Json<StartInstanceRequest>,
) -> Result<Json<StartInstanceResponse>, StatusCode> {
    if payload.account_id.is_empty() || payload.workflow_type.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state
        .coordinator
        .start(&payload.account_id, payload.context, &payload.workflow_type)
        .await
    {
        Ok(instance_id) => Ok(Json(StartInstanceResponse {
            instance_id,
            message: format!(
                "Workflow '{}' started for account '{}'",
                payload.workflow_type, payload.account_id
            ),
        })),
        Err(e) => {
            tracing::warn!("Failed to start instance for {}: {e}", payload.account_id);
            Err(crate::api::error_status(&e))
        }
    }
}

/// GET /api/instances — all live (active or paused) instances.
async fn list_active(
    State(state): State<EngineAppState>,
) -> Result<Json<Value>, StatusCode> {
    match state.coordinator.list_active().await {
        Ok(instances) => Ok(Json(json!({ "instances": instances }))),
        Err(e) => {
            tracing::error!("Failed to list instances: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/instances/:account_id — latest instance snapshot (terminal
/// instances included, with their last error).
async fn instance_status(
    State(state): State<EngineAppState>,
    Path(account_id): Path<String>,
) -> Result<Json<InstanceView>, StatusCode> {
    state
        .coordinator
        .status(&account_id)
        .await
        .map(Json)
        .map_err(|e| crate::api::error_status(&e))
}

/// POST /api/instances/:account_id/pause
async fn pause_instance(
    State(state): State<EngineAppState>,
    Path(account_id): Path<String>,
) -> Result<Json<InstanceView>, StatusCode> {
    state
        .coordinator
        .pause(&account_id)
        .await
        .map(Json)
        .map_err(|e| crate::api::error_status(&e))
}

/// POST /api/instances/:account_id/resume
async fn resume_instance(
    State(state): State<EngineAppState>,
    Path(account_id): Path<String>,
) -> Result<Json<InstanceView>, StatusCode> {
    state
        .coordinator
        .resume(&account_id)
        .await
        .map(Json)
        .map_err(|e| crate::api::error_status(&e))
}

/// POST /api/instances/:account_id/stop
async fn stop_instance(
    State(state): State<EngineAppState>,
    Path(account_id): Path<String>,
) -> Result<Json<InstanceView>, StatusCode> {
    state
        .coordinator
        .stop(&account_id)
        .await
        .map(Json)
        .map_err(|e| crate::api::error_status(&e))
}

/// GET /api/instances/:account_id/log — append-only execution audit trail.
async fn instance_log(
    State(state): State<EngineAppState>,
    Path(account_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let view = state
        .coordinator
        .status(&account_id)
        .await
        .map_err(|e| crate::api::error_status(&e))?;

    match state.store.list_log(view.instance_id, 500).await {
        Ok(entries) => Ok(Json(json!({
            "instance_id": view.instance_id,
            "entries": entries,
        }))),
        Err(e) => {
            tracing::error!("Failed to load execution log for {account_id}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/stats — aggregate engine counters.
async fn statistics(
    State(state): State<EngineAppState>,
) -> Result<Json<EngineStatistics>, StatusCode> {
    state
        .coordinator
        .statistics()
        .await
        .map(Json)
        .map_err(|e| crate::api::error_status(&e))
}
