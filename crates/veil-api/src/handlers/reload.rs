//! /v1/reload handler.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use veil_services::ReloadReport;

use super::{internal_error, ApiState, ErrorResponse};

/// Refresh the registry and reconcile, waiting for any cycle already running.
pub async fn handle_reload(
    State(state): State<ApiState>,
) -> Result<Json<ReloadReport>, (StatusCode, Json<ErrorResponse>)> {
    match state.coordinator.reload().await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            tracing::warn!(error = %e, "reload requested over API failed");
            Err(internal_error(e))
        }
    }
}
