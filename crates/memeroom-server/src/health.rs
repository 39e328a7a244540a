use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// Structured health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: ConnectionInfo,
    pub rooms: RoomInfo,
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub websocket: usize,
}

#[derive(Serialize)]
pub struct RoomInfo {
    pub active: usize,
    pub waiting: usize,
    pub playing: usize,
    pub players: usize,
}

/// Server status, connection counts and room counts as JSON.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ws = state.ws_connection_count.load(Ordering::Relaxed);
    let stats = state.registry.stats();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: ConnectionInfo { websocket: ws },
        rooms: RoomInfo {
            active: stats.rooms,
            waiting: stats.waiting,
            playing: stats.playing,
            players: stats.members,
        },
    })
}

pub async fn readiness_check(State(state): State<AppState>) -> &'static str {
    if state.config.game.max_rounds == 0 {
        return "not ready: no rounds configured";
    }
    "ready"
}
