use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{AppResult, AppState, events::game_payload, lifecycle::RoomLifecycle, session::AuthUser};

#[debug_handler(state = AppState)]
pub(crate) async fn start_game(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    let game = lifecycle.start_game(&room_id, &email).await?;
    Ok((StatusCode::CREATED, Json(game_payload(&game))).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn end_game(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    lifecycle.end_game(&room_id, &email).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn participate(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    let participation = lifecycle.participate(&room_id, &email).await?;
    Ok((StatusCode::CREATED, Json(participation)).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn cancel_participation(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    lifecycle.cancel_participation(&room_id, &email).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
