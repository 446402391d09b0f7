use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{AppResult, AppState, lifecycle::RoomLifecycle, models::RoomRequest, session::AuthUser};

#[debug_handler(state = AppState)]
pub(crate) async fn create_room(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,

    Json(request): Json<RoomRequest>,
) -> AppResult<Response> {
    let room = lifecycle.create_room(&email, request).await?;
    Ok((StatusCode::CREATED, Json(room.public())).into_response())
}

/// Lobby listing for one game, passwords left out.
#[debug_handler(state = AppState)]
pub(crate) async fn list_rooms(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(_): AuthUser,
    Path(game_name): Path<String>,
) -> AppResult<Response> {
    Ok(Json(lifecycle.list_rooms(&game_name).await?).into_response())
}
