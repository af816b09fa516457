//! HTTP API layer.
//!
//! REST endpoints for definition management and the instance control
//! surface. Handlers stay thin: validate input, call the engine, map
//! engine errors onto HTTP statuses.

pub mod definitions;
pub mod instances;

use crate::error::EngineError;
use axum::http::StatusCode;

/// Map engine errors onto HTTP statuses.
pub(crate) fn error_status(error: &EngineError) -> StatusCode {
    match error {
        EngineError::DuplicateActiveInstance { .. } => StatusCode::CONFLICT,
        EngineError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        EngineError::DefinitionMissing { .. } => StatusCode::NOT_FOUND,
        EngineError::InstanceNotFound { .. } => StatusCode::NOT_FOUND,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::LockTimeout { .. } | EngineError::StoreConflict { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
