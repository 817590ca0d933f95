use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use uuid::Uuid;

use crate::auth::AppState;

/// GET /rooms/{room_id}/presence
///
/// The room's live set right now. Reading evaluates deadlines, so anyone
/// past the timeout is gone from the answer.
pub async fn get_presence(State(state): State<AppState>, Path(room_id): Path<Uuid>) -> impl IntoResponse {
    Json(state.store.presence(room_id).await)
}
