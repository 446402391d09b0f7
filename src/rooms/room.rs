use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{AppResult, AppState, lifecycle::RoomLifecycle, models::RoomRequest, session::AuthUser};

#[debug_handler(state = AppState)]
pub(crate) async fn room_info(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(_): AuthUser,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    Ok(Json(lifecycle.room_info(&room_id).await?).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn edit_room(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,

    Json(request): Json<RoomRequest>,
) -> AppResult<Response> {
    let room = lifecycle.edit_room(&room_id, &email, &request).await?;
    Ok(Json(room.public()).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn delete_room(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    lifecycle.delete_room(&room_id, &email).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
