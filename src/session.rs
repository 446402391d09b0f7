//! Who is calling. Identity comes from a gateway header or from the session cookie it pinned.

use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{FromRef, FromRequestParts},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tower_sessions::Session;
use tracing::info;

use crate::{AppResult, AppState, appresult::LobbyError, config::Config};

pub const USER_EMAIL: &str = "user_email";

/// The authenticated caller's email. Rejects with 401 when there is none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

fn trusted_email(parts: &Parts, config: &Config) -> Option<String> {
    let header = config.trusted_email_header.as_deref()?;
    parts
        .headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .map(str::to_owned)
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<Config>: FromRef<S>,
{
    type Rejection = crate::AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let config = Arc::<Config>::from_ref(state);
        if let Some(email) = trusted_email(parts, &config) {
            return Ok(Self(email));
        }

        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(|(_, msg)| anyhow::anyhow!(msg))?;
        match session.get::<String>(USER_EMAIL).await? {
            Some(email) => Ok(Self(email)),
            None => Err(LobbyError::Unauthenticated.into()),
        }
    }
}

/// Pins the gateway-supplied identity into the session so later requests (and socket
/// upgrades, which can't carry custom headers from a browser) only need the cookie.
#[debug_handler(state = AppState)]
pub(crate) async fn sign_in(AuthUser(email): AuthUser, session: Session) -> AppResult<Response> {
    session.insert(USER_EMAIL, &email).await?;
    info!(user = %email, "session started");
    Ok(Json(json!({ "email": email })).into_response())
}

#[debug_handler]
pub(crate) async fn sign_out(session: Session) -> AppResult<Response> {
    session.flush().await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
