use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    AppResult, AppState,
    registry::{Connection, Topic},
    session::AuthUser,
};

use super::msg::SendMessageQuery;

#[debug_handler(state = AppState)]
pub(crate) async fn all_ws(
    State(app): State<AppState>,
    AuthUser(email): AuthUser,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(async move |socket| serve(socket, app, email, Topic::All).await)
}

#[debug_handler(state = AppState)]
pub(crate) async fn game_ws(
    State(app): State<AppState>,
    AuthUser(email): AuthUser,
    Path(game_name): Path<String>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let topic = Topic::game(&game_name);
    ws.on_upgrade(async move |socket| serve(socket, app, email, topic).await)
}

/// Rejects unknown rooms before upgrading.
#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    State(app): State<AppState>,
    AuthUser(email): AuthUser,
    Path(room_id): Path<String>,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let room = app.lifecycle.room(&room_id).await?;
    let topic = Topic::room(room.id);

    Ok(ws
        .on_upgrade(async move |socket| serve(socket, app, email, topic).await)
        .into_response())
}

/// Runs one socket until either side gives up, then tears it down once.
async fn serve(socket: WebSocket, app: AppState, email: String, topic: Topic) {
    let (tx, outbound) = mpsc::channel(app.config.outbound_buffer.max(1));
    let conn = Arc::new(Connection::new(email, tx));
    if !app.dispatcher.registry().subscribe(topic.clone(), &conn) {
        return;
    }
    info!(
        conn_id = %conn.id(),
        user = %conn.user_email(),
        %topic,
        connections = app.dispatcher.registry().connection_count(),
        "socket connected"
    );

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_frames(sink, outbound, conn.clone(), app.config.write_timeout));

    if let Some(room_id) = topic.room_id() {
        app.lifecycle.announce_join(room_id, conn.user_email()).await;
    }

    loop {
        let incoming = tokio::select! {
            _ = conn.closed() => break,
            incoming = stream.next() => incoming,
        };

        match incoming {
            Some(Ok(Message::Text(text))) => {
                let Some(room_id) = topic.room_id() else {
                    continue;
                };
                let Ok(SendMessageQuery { message }) = serde_json::from_str(text.as_str()) else {
                    debug!(conn_id = %conn.id(), "ignoring malformed frame");
                    continue;
                };
                if let Err(e) = app.lifecycle.post_message(room_id, conn.user_email(), &message).await {
                    debug!(conn_id = %conn.id(), error = %e, "chat message rejected");
                }
            }
            // pings are answered by the transport
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "socket read failed");
                break;
            }
        }
    }

    writer.abort();
    app.dispatcher.disconnect(&conn);
    info!(conn_id = %conn.id(), age = ?conn.age(), dropped_frames = conn.dropped_frames(), "socket closed");
}

/// Drains the outbound queue into the socket. A failed or slow write closes the connection.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Arc<String>>,
    conn: Arc<Connection>,
    write_timeout: std::time::Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = conn.closed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match timeout(write_timeout, sink.send(Message::Text(frame.as_str().into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "socket write failed");
                break;
            }
            Err(_) => {
                warn!(conn_id = %conn.id(), timeout = ?write_timeout, "socket write timed out");
                break;
            }
        }
    }

    conn.close();
}
