//! Socket endpoints over a real listener.

use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use lobbycast::{AppState, app, config::Config, models::RoomRequest, registry::Topic, store::SqliteStore};
use serde_json::{Value, json};
use tokio::{net::TcpListener, time::timeout};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message, client::IntoClientRequest, http::HeaderValue},
};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const IDENTITY: &str = "x-user-email";

/// Serves `app()` on a random port. Returns the state and the `ws://` API base.
async fn start_server(config: Config) -> (AppState, String) {
    let store = SqliteStore::in_memory(1024).await.unwrap();
    let config = Config {
        owner_grace: Duration::ZERO,
        trusted_email_header: Some(IDENTITY.to_owned()),
        ..config
    };
    let state = AppState::start(Arc::new(store), config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (state, format!("ws://{addr}/api/v1"))
}

async fn connect(base: &str, path: &str, user: &str) -> Result<Client, tungstenite::Error> {
    let mut request = format!("{base}{path}").into_client_request()?;
    request
        .headers_mut()
        .insert(IDENTITY, HeaderValue::from_str(user).unwrap());
    let (client, _) = connect_async(request).await?;
    Ok(client)
}

async fn create_room(state: &AppState, owner: &str) -> String {
    let request: RoomRequest = serde_json::from_value(json!({"gameName": "uno"})).unwrap();
    state.lifecycle.create_room(owner, request).await.unwrap().id
}

async fn next_event(client: &mut Client) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no frame within 2s")
            .expect("socket closed")
            .unwrap();
        if frame.is_text() {
            return serde_json::from_str(frame.to_text().unwrap()).unwrap();
        }
    }
}

/// Skips events until one of `event_type` arrives.
async fn next_of(client: &mut Client, event_type: &str) -> Value {
    loop {
        let event = next_event(client).await;
        if event["type"] == event_type {
            return event;
        }
    }
}

/// Event types that arrive within `window`.
async fn drain(client: &mut Client, window: Duration) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(Some(Ok(frame))) = timeout(window, client.next()).await {
        if let Ok(text) = frame.to_text() {
            if let Ok(event) = serde_json::from_str::<Value>(text) {
                seen.push(event["type"].as_str().unwrap_or_default().to_owned());
            }
        }
    }
    seen
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{what} did not happen within 5s");
}

#[tokio::test]
async fn joins_are_announced_and_chat_frames_become_messages() {
    let (state, base) = start_server(Config::default()).await;
    let room_id = create_room(&state, "a@x.com").await;
    let path = format!("/ws/rooms/{room_id}");

    let mut owner = connect(&base, &path, "a@x.com").await.unwrap();
    let joined = next_event(&mut owner).await;
    assert_eq!(joined["type"], "new_user");
    assert_eq!(joined["data"]["email"], "a@x.com");

    let mut member = connect(&base, &path, "b@x.com").await.unwrap();
    let joined = next_of(&mut owner, "new_user").await;
    assert_eq!(joined["data"]["email"], "b@x.com");

    member
        .send(Message::text(json!({"message": "gg"}).to_string()))
        .await
        .unwrap();
    // frames that are not `{message}` are ignored
    member.send(Message::text("not json")).await.unwrap();

    let message = next_of(&mut owner, "new_message").await;
    assert_eq!(message["data"]["content"], "gg");
    assert_eq!(message["data"]["userId"], "b@x.com");
    assert_eq!(next_of(&mut member, "new_message").await["data"]["content"], "gg");
}

#[tokio::test]
async fn unknown_room_is_refused_before_upgrade() {
    let (_state, base) = start_server(Config::default()).await;

    match connect(&base, "/ws/rooms/missing", "a@x.com").await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 404),
        Err(e) => panic!("expected an HTTP refusal, got {e}"),
        Ok(_) => panic!("upgrade to a missing room succeeded"),
    }

    let anonymous = format!("{base}/ws/all").into_client_request().unwrap();
    match connect_async(anonymous).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn owner_socket_close_tears_down_once() {
    let (state, base) = start_server(Config::default()).await;
    let room_id = create_room(&state, "a@x.com").await;
    let path = format!("/ws/rooms/{room_id}");

    let mut owner = connect(&base, &path, "a@x.com").await.unwrap();
    next_of(&mut owner, "new_user").await;
    let mut member = connect(&base, &path, "b@x.com").await.unwrap();
    next_of(&mut member, "new_user").await;
    let registry = state.registry().clone();
    eventually("both sockets registered", || registry.connection_count() == 2).await;

    owner.close(None).await.unwrap();

    let left = next_of(&mut member, "user_left").await;
    assert_eq!(left["data"]["email"], "a@x.com");
    next_of(&mut member, "game_ended").await;
    let rest = drain(&mut member, Duration::from_millis(300)).await;
    assert!(!rest.contains(&"user_left".to_owned()), "teardown repeated: {rest:?}");

    assert!(state.lifecycle.find_room(&room_id).await.unwrap().is_none());
    eventually("owner socket forgotten", || registry.connection_count() == 1).await;

    member.close(None).await.unwrap();
    eventually("member socket forgotten", || registry.connection_count() == 0).await;
    assert_eq!(registry.subscriber_count(&Topic::room(&room_id)), 0);
}

#[tokio::test]
async fn stalled_reader_is_dropped_after_the_write_timeout() {
    let config = Config {
        // large enough that only the write timeout can drop the socket
        outbound_buffer: 100_000,
        write_timeout: Duration::from_millis(100),
        ..Config::default()
    };
    let (state, base) = start_server(config).await;
    let room_id = create_room(&state, "a@x.com").await;
    let topic = Topic::room(&room_id);

    let _stalled = connect(&base, &format!("/ws/rooms/{room_id}"), "b@x.com").await.unwrap();
    let registry = state.registry().clone();
    eventually("stalled socket registered", || registry.subscriber_count(&topic) == 1).await;

    let bulk = "x".repeat(64 * 1024);
    for _ in 0..400 {
        if registry.subscriber_count(&topic) == 0 {
            break;
        }
        state.lifecycle.post_message(&room_id, "a@x.com", &bulk).await.unwrap();
    }

    eventually("stalled socket dropped", || registry.subscriber_count(&topic) == 0).await;
    assert_eq!(registry.connection_count(), 0);
}
