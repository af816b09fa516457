//! Definition management REST API.
//!
//! CRUD for workflow definitions with hot-reload: every save writes a new
//! immutable version and swaps it into the registry, so new starts pick it
//! up immediately while running instances keep their pinned version.

use crate::workflow::{
    registry::DefinitionRegistry, storage::DefinitionStorage, types::WorkflowDefinition,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for definition routes.
#[derive(Clone)]
pub struct DefinitionAppState {
    pub storage: DefinitionStorage,
    pub registry: Arc<DefinitionRegistry>,
}

/// Response for definition save operations.
#[derive(Debug, Serialize)]
pub struct DefinitionResponse {
    pub workflow_type: String,
    pub version: i64,
    pub message: String,
}

/// Request body for definition saves.
#[derive(Debug, Deserialize)]
pub struct SaveDefinitionRequest {
    pub definition: WorkflowDefinition,
}

/// Create definition management routes.
pub fn create_definition_routes() -> Router<DefinitionAppState> {
    Router::new()
        .route("/api/definitions", post(save_definition))
        .route("/api/definitions", get(list_definitions))
        .route("/api/definitions/{workflow_type}", get(get_definition))
        .route("/api/definitions/{workflow_type}", delete(delete_definition))
}

/// Save a definition (new version).
///
/// POST /api/definitions
/// Body: { "definition": { "workflow_type": "...", "name": "...", "steps": [...] } }
async fn save_definition(
    State(state): State<DefinitionAppState>,
    Json(payload): Json<SaveDefinitionRequest>,
) -> Result<Json<DefinitionResponse>, StatusCode> {
    let definition = payload.definition;

    if definition.workflow_type.is_empty() || definition.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let version = match state.storage.save_definition(&definition).await {
        Ok(version) => version,
        Err(e) => {
            tracing::error!("Failed to save definition: {e}");
            return Err(crate::api::error_status(&e));
        }
    };

    if let Err(e) = state.registry.reload(&definition.workflow_type).await {
        tracing::error!("Failed to reload definition into registry: {e}");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    tracing::info!(
        "🔥 Saved definition: {} v{version} ({})",
        definition.workflow_type,
        definition.name
    );

    Ok(Json(DefinitionResponse {
        workflow_type: definition.workflow_type.clone(),
        version,
        message: format!("Definition '{}' saved as v{version}", definition.name),
    }))
}

/// List the latest version of every definition.
///
/// GET /api/definitions
async fn list_definitions(
    State(state): State<DefinitionAppState>,
) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_latest().await {
        Ok(definitions) => Ok(Json(json!({ "definitions": definitions }))),
        Err(e) => {
            tracing::error!("Failed to list definitions: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Get the latest version of one definition.
///
/// GET /api/definitions/:workflow_type
async fn get_definition(
    State(state): State<DefinitionAppState>,
    Path(workflow_type): Path<String>,
) -> Result<Json<WorkflowDefinition>, StatusCode> {
    match state.storage.get_latest(&workflow_type).await {
        Ok(Some(definition)) => Ok(Json(definition)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get definition {workflow_type}: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Delete all versions of a definition.
///
/// DELETE /api/definitions/:workflow_type
async fn delete_definition(
    State(state): State<DefinitionAppState>,
    Path(workflow_type): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.registry.remove(&workflow_type);

    match state.storage.delete_definition(&workflow_type).await {
        Ok(true) => {
            tracing::info!("Deleted definition: {workflow_type}");
            Ok(Json(json!({ "message": "Definition deleted successfully" })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to delete definition: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
