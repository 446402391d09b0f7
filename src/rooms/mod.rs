mod game;
mod msg;
mod new;
mod room;
mod ws;

use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", post(new::create_room))
        .route("/games/{game_name}/rooms", get(new::list_rooms))
        .route(
            "/rooms/{room_id}",
            get(room::room_info).patch(room::edit_room).delete(room::delete_room),
        )
        .route("/rooms/{room_id}/start", post(game::start_game))
        .route("/rooms/{room_id}/game", delete(game::end_game))
        .route(
            "/rooms/{room_id}/participate",
            post(game::participate).delete(game::cancel_participation),
        )
        .route("/rooms/{room_id}/messages", post(msg::post_message))
        .route("/ws/all", get(ws::all_ws))
        .route("/ws/games/{game_name}", get(ws::game_ws))
        .route("/ws/rooms/{room_id}", get(ws::room_ws))
}
