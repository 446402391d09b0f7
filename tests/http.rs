use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use lobbycast::{AppState, app, config::Config, store::SqliteStore};
use serde_json::{Value, json};
use tower::ServiceExt;

const IDENTITY: &str = "x-user-email";

async fn setup() -> Router {
    let store = SqliteStore::in_memory(256).await.unwrap();
    let config = Config {
        owner_grace: Duration::ZERO,
        trusted_email_header: Some(IDENTITY.to_owned()),
        ..Config::default()
    };
    app(AppState::start(Arc::new(store), config))
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header(IDENTITY, user);
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

async fn create_uno_room(app: &Router) -> String {
    let (status, room) = call(
        app,
        Method::POST,
        "/api/v1/rooms",
        Some("a@x.com"),
        Some(json!({"gameName": "Uno", "roomPassword": "pw", "capacity": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    room["id"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn anonymous_requests_are_rejected() {
    let app = setup().await;
    let (status, body) = call(&app, Method::POST, "/api/v1/rooms", None, Some(json!({"gameName": "uno"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn create_and_list_rooms() {
    let app = setup().await;
    let id = create_uno_room(&app).await;
    assert_eq!(id.len(), 9);

    let (status, rooms) = call(&app, Method::GET, "/api/v1/games/UNO/rooms", Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::OK);
    let rooms = rooms.as_array().unwrap();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0]["gameName"], "uno");
    assert!(rooms[0].get("password").is_none());

    let (status, info) = call(&app, Method::GET, &format!("/api/v1/rooms/{id}"), Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["ownerEmail"], "a@x.com");
    assert_eq!(info["ownerName"], "a@x.com");

    let (status, _) = call(&app, Method::GET, "/api/v1/rooms/missing", Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_game_name_is_a_bad_request() {
    let app = setup().await;
    let (status, _) = call(&app, Method::POST, "/api/v1/rooms", Some("a@x.com"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn only_the_owner_starts_and_ends_games() {
    let app = setup().await;
    let id = create_uno_room(&app).await;
    let start = format!("/api/v1/rooms/{id}/start");

    let (status, _) = call(&app, Method::POST, &start, Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, game) = call(&app, Method::POST, &start, Some("a@x.com"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(game["roomId"], id.as_str());
    assert_eq!(game["participants"], json!(["a@x.com"]));

    let (status, _) = call(&app, Method::POST, &start, Some("a@x.com"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let end = format!("/api/v1/rooms/{id}/game");
    let (status, _) = call(&app, Method::DELETE, &end, Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, Method::DELETE, &end, Some("a@x.com"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::DELETE, &end, Some("a@x.com"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn edits_are_partial_and_owner_only() {
    let app = setup().await;
    let id = create_uno_room(&app).await;
    let uri = format!("/api/v1/rooms/{id}");

    let (status, body) = call(&app, Method::PATCH, &uri, Some("a@x.com"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "no fields to update");

    let (status, body) = call(&app, Method::PATCH, &uri, Some("a@x.com"), Some(json!({"gameName": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid request: gameName must not be blank");
    let (status, _) = call(&app, Method::PATCH, &uri, Some("a@x.com"), Some(json!({"capacity": -1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::PATCH, &uri, Some("b@x.com"), Some(json!({"isLocked": true}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, room) = call(&app, Method::PATCH, &uri, Some("a@x.com"), Some(json!({"isLocked": true}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(room["isLocked"], true);
    assert_eq!(room["capacity"], 4);
}

#[tokio::test]
async fn participation_and_chat() {
    let app = setup().await;
    let id = create_uno_room(&app).await;
    let participate = format!("/api/v1/rooms/{id}/participate");

    let (status, joined) = call(&app, Method::POST, &participate, Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(joined["userId"], "b@x.com");

    let (status, _) = call(&app, Method::POST, &participate, Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(&app, Method::DELETE, &participate, Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let messages = format!("/api/v1/rooms/{id}/messages");
    let (status, message) = call(&app, Method::POST, &messages, Some("b@x.com"), Some(json!({"message": "gl hf"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["content"], "gl hf");

    call(&app, Method::PATCH, &format!("/api/v1/rooms/{id}"), Some("a@x.com"), Some(json!({"textChatOn": false}))).await;
    let (status, _) = call(&app, Method::POST, &messages, Some("b@x.com"), Some(json!({"message": "hi"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn owner_deletes_room() {
    let app = setup().await;
    let id = create_uno_room(&app).await;
    let uri = format!("/api/v1/rooms/{id}");

    let (status, _) = call(&app, Method::DELETE, &uri, Some("b@x.com"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(&app, Method::DELETE, &uri, Some("a@x.com"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Method::GET, &uri, Some("a@x.com"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_carries_identity_after_sign_in() {
    let app = setup().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/session")
        .header(IDENTITY, "a@x.com")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .unwrap()
        .to_owned();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/rooms")
        .header(header::COOKIE, cookie)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"gameName": "uno"}).to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let room: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(room["ownerEmail"], "a@x.com");
}
