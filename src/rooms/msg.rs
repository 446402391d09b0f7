use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::{AppResult, AppState, lifecycle::RoomLifecycle, session::AuthUser};

/// Chat body, over HTTP or as a room socket text frame.
#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageQuery {
    pub message: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn post_message(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,

    Json(SendMessageQuery { message }): Json<SendMessageQuery>,
) -> AppResult<Response> {
    let message = lifecycle.post_message(&room_id, &email, &message).await?;
    Ok((StatusCode::CREATED, Json(message)).into_response())
}
