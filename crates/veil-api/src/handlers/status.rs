//! /v1/status, /v1/peers and /ping handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use veil_services::Status;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

pub async fn handle_status(State(state): State<ApiState>) -> Json<Status> {
    Json(state.coordinator.status())
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub revision: u64,
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub endpoint: String,
    #[serde(rename = "self")]
    pub is_self: bool,
    pub overlay_addresses: Vec<String>,
    pub revision: u64,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let snapshot = state.coordinator.registry().current();
    let peers = snapshot
        .peers
        .values()
        .map(|p| PeerInfo {
            id: p.id.clone(),
            endpoint: p.endpoint.to_string(),
            is_self: p.is_self,
            overlay_addresses: p.overlay_addresses.iter().map(|n| n.to_string()).collect(),
            revision: p.revision,
        })
        .collect();

    Json(PeersResponse {
        revision: snapshot.revision,
        peers,
    })
}

// ── /ping ─────────────────────────────────────────────────────────────────────

pub async fn handle_ping() -> &'static str {
    "pong"
}
