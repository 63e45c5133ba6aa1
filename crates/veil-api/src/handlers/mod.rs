//! HTTP API handlers, a thin layer over the reload coordinator.

pub mod reload;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use veil_services::Coordinator;

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Arc<Coordinator>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn internal_error(error: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

pub use reload::handle_reload;
pub use status::{handle_peers, handle_ping, handle_status};
