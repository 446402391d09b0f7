//! Outbound event envelope and the mapping from store mutations to events.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::{
    models::{Game, GameStatus, Message, Participation, Room, from_document},
    registry::Topic,
    store::{Collection, DocumentStore, Filter, Mutation, MutationKind, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RoomAdded,
    RoomUpdated,
    RoomDeleted,
    RoomCountUpdate,
    GameStarted,
    GameEnded,
    UserParticipated,
    UserCanceledParticipation,
    NewMessage,
    NewUser,
    UserLeft,
}

/// `{"type": ..., "data": ...}` as written to every socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self { event_type, data }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedEvent {
    pub topic: Topic,
    pub event: Event,
}

impl RoutedEvent {
    fn new(topic: Topic, event_type: EventType, data: Value) -> Self {
        Self {
            topic,
            event: Event::new(event_type, data),
        }
    }
}

/// Turns one mutation into the events it implies, in a fixed order.
///
/// Reads the store for derived facts (room counts, remaining games) but never writes. A failed
/// read only drops the derived events; events built from the mutation itself are kept.
pub struct EventRouter {
    store: Arc<dyn DocumentStore>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn route(&self, mutation: &Mutation) -> Result<Vec<RoutedEvent>, StoreError> {
        let Some(kind) = mutation.kind() else {
            return Ok(Vec::new());
        };

        match mutation.collection {
            Collection::Rooms => self.route_room(kind, mutation).await,
            Collection::Games => self.route_game(kind, mutation).await,
            Collection::Participation => route_participation(kind, mutation),
            Collection::Messages => route_message(kind, mutation),
            Collection::Users => Ok(Vec::new()),
        }
    }

    async fn route_room(
        &self,
        kind: MutationKind,
        mutation: &Mutation,
    ) -> Result<Vec<RoutedEvent>, StoreError> {
        let mut events = Vec::new();

        match (&mutation.previous, &mutation.current, kind) {
            (_, Some(current), MutationKind::Create) => {
                let room: Room = from_document(current)?;
                events.push(RoutedEvent::new(
                    Topic::game(&room.game_name),
                    EventType::RoomAdded,
                    room.public(),
                ));
                events.extend(self.room_counts(&room.game_name).await);
            }
            (Some(previous), Some(current), MutationKind::Update) => {
                let before: Room = from_document(previous)?;
                let after: Room = from_document(current)?;

                if before.settings() != after.settings() {
                    events.push(RoutedEvent::new(
                        Topic::room(&after.id),
                        EventType::RoomUpdated,
                        json!({ "settings": after.settings() }),
                    ));
                }

                if before.game_name != after.game_name {
                    events.push(RoutedEvent::new(
                        Topic::game(&before.game_name),
                        EventType::RoomDeleted,
                        before.public(),
                    ));
                    events.extend(self.room_counts(&before.game_name).await);
                    events.push(RoutedEvent::new(
                        Topic::game(&after.game_name),
                        EventType::RoomAdded,
                        after.public(),
                    ));
                    events.extend(self.room_counts(&after.game_name).await);
                } else if before.public() != after.public() {
                    events.push(RoutedEvent::new(
                        Topic::game(&after.game_name),
                        EventType::RoomUpdated,
                        after.public(),
                    ));
                }
            }
            (Some(previous), None, MutationKind::Delete) => {
                let room: Room = from_document(previous)?;
                events.push(RoutedEvent::new(
                    Topic::game(&room.game_name),
                    EventType::RoomDeleted,
                    room.public(),
                ));
                events.extend(self.room_counts(&room.game_name).await);
                events.extend(self.game_ended_if_none_left(&room.id).await);
            }
            _ => {}
        }

        Ok(events)
    }

    async fn route_game(
        &self,
        kind: MutationKind,
        mutation: &Mutation,
    ) -> Result<Vec<RoutedEvent>, StoreError> {
        match (kind, mutation.latest()) {
            (MutationKind::Update, Some(current)) => {
                let game: Game = from_document(current)?;
                if game.status != GameStatus::Started {
                    return Ok(Vec::new());
                }
                Ok(vec![RoutedEvent::new(
                    Topic::room(&game.room_id),
                    EventType::GameStarted,
                    game_payload(&game),
                )])
            }
            (MutationKind::Delete, Some(previous)) => {
                let game: Game = from_document(previous)?;
                Ok(self.game_ended_if_none_left(&game.room_id).await)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// `room_count_update` for one game, to its lobby and to the global topic.
    async fn room_counts(&self, game_name: &str) -> Vec<RoutedEvent> {
        let count = match self
            .store
            .count(Collection::Rooms, &Filter::eq("gameName", game_name))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(game = %game_name, error = %e, "room count lookup failed");
                return Vec::new();
            }
        };
        let data = json!({ "gameName": game_name, "count": count });

        vec![
            RoutedEvent::new(Topic::game(game_name), EventType::RoomCountUpdate, data.clone()),
            RoutedEvent::new(Topic::All, EventType::RoomCountUpdate, data),
        ]
    }

    async fn game_ended_if_none_left(&self, room_id: &str) -> Vec<RoutedEvent> {
        match self
            .store
            .count(Collection::Games, &Filter::eq("roomId", room_id))
            .await
        {
            Ok(0) => vec![RoutedEvent::new(
                Topic::room(room_id),
                EventType::GameEnded,
                json!({ "roomId": room_id }),
            )],
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(room_id, error = %e, "remaining games lookup failed");
                Vec::new()
            }
        }
    }
}

pub fn game_payload(game: &Game) -> Value {
    json!({
        "gameId": game.id,
        "roomId": game.room_id,
        "gameName": game.game_name,
        "ownerId": game.owner_id,
        "participants": game.participants,
    })
}

fn route_participation(
    kind: MutationKind,
    mutation: &Mutation,
) -> Result<Vec<RoutedEvent>, StoreError> {
    let Some(doc) = mutation.latest() else {
        return Ok(Vec::new());
    };

    let event = match kind {
        MutationKind::Create => {
            let p: Participation = from_document(doc)?;
            RoutedEvent::new(
                Topic::room(&p.room_id),
                EventType::UserParticipated,
                json!({
                    "userId": p.user_id,
                    "userName": p.user_name,
                    "userAvatar": p.user_avatar,
                    "userLevel": p.user_level,
                }),
            )
        }
        MutationKind::Delete => {
            let p: Participation = from_document(doc)?;
            RoutedEvent::new(
                Topic::room(&p.room_id),
                EventType::UserCanceledParticipation,
                json!({ "userId": p.user_id }),
            )
        }
        MutationKind::Update => return Ok(Vec::new()),
    };

    Ok(vec![event])
}

fn route_message(kind: MutationKind, mutation: &Mutation) -> Result<Vec<RoutedEvent>, StoreError> {
    let (MutationKind::Create, Some(doc)) = (kind, &mutation.current) else {
        return Ok(Vec::new());
    };

    let message: Message = from_document(doc)?;
    Ok(vec![RoutedEvent::new(
        Topic::room(&message.room_id),
        EventType::NewMessage,
        json!({
            "id": message.id,
            "userId": message.user_id,
            "userName": message.user_name,
            "userAvatar": message.user_avatar,
            "content": message.content,
        }),
    )])
}
