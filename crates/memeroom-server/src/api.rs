use axum::extract::{Path, State};
use axum::response::Json;
use serde::Serialize;

use memeroom_core::ids::RoomId;
use memeroom_core::room::RoomSummary;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomSummary>,
}

/// GET /api/v1/rooms: public rooms waiting for players, oldest first.
pub async fn list_rooms(State(state): State<AppState>) -> Json<RoomListResponse> {
    Json(RoomListResponse {
        rooms: state.registry.list_public_rooms(),
    })
}

/// GET /api/v1/rooms/{room_id}
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSummary>, AppError> {
    let room_id: RoomId = room_id
        .parse()
        .map_err(|_| AppError::BadRequest(format!("invalid room id: {room_id}")))?;
    state
        .registry
        .room_summary(room_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("room {room_id} not found")))
}
