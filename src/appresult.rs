use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::store::StoreError;

/// Domain failures a caller can act on.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    #[error("not signed in")]
    Unauthenticated,
    #[error("only the room owner can {0}")]
    NotOwner(&'static str),
    #[error("room {0} not found")]
    RoomNotFound(String),
    #[error("a game is already running in room {0}")]
    GameAlreadyStarted(String),
    #[error("no game is running in room {0}")]
    NoGame(String),
    #[error("already participating in room {0}")]
    AlreadyParticipating(String),
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("level {have} is below the room minimum of {need}")]
    LevelTooLow { have: i64, need: i64 },
    #[error("text chat is turned off in room {0}")]
    TextChatDisabled(String),
    #[error("no fields to update")]
    NoFieldsToUpdate,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LobbyError {
    pub fn status(&self) -> StatusCode {
        use LobbyError::*;
        match self {
            Unauthenticated => StatusCode::UNAUTHORIZED,
            NotOwner(_) | LevelTooLow { .. } | TextChatDisabled(_) => StatusCode::FORBIDDEN,
            RoomNotFound(_) | NoGame(_) => StatusCode::NOT_FOUND,
            GameAlreadyStarted(_) | AlreadyParticipating(_) | RoomFull(_) => StatusCode::CONFLICT,
            NoFieldsToUpdate | InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self
            .0
            .downcast_ref::<LobbyError>()
            .map(LobbyError::status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(error = ?self.0, "request failed");
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
