//! Room state transitions and the rules that guard them.
//!
//! Writes go to the store only; the change observers turn them into broadcasts. The exceptions
//! are `game_started` and presence, which have no store mutation to route from.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    appresult::LobbyError,
    dispatch::{DroppedConnection, Dispatcher},
    events::{Event, EventType, game_payload},
    models::{
        Game, GameStatus, Message, Participation, Room, RoomRequest, UserProfile, from_document,
        new_room_id, to_document,
    },
    registry::{ConnectionRegistry, Topic},
    store::{Collection, Document, DocumentStore, Filter, StoreError},
};

/// Room listings are capped at this many entries.
pub const ROOM_LIST_LIMIT: usize = 50;

const ID_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Open,
    GameStarted,
    Closed,
}

pub struct RoomLifecycle {
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<Dispatcher>,
    owner_grace: Duration,
    /// Per-room lock held across the capacity check and the participation insert.
    joins: DashMap<String, Arc<Mutex<()>>>,
}

impl RoomLifecycle {
    pub fn new(store: Arc<dyn DocumentStore>, dispatcher: Arc<Dispatcher>, owner_grace: Duration) -> Self {
        Self {
            store,
            dispatcher,
            owner_grace,
            joins: DashMap::new(),
        }
    }

    fn join_lock(&self, room_id: &str) -> Arc<Mutex<()>> {
        self.joins.entry(room_id.to_owned()).or_default().clone()
    }

    fn check_request(request: &RoomRequest) -> Result<(), LobbyError> {
        match request.invalid_field() {
            Some(problem) => Err(LobbyError::InvalidRequest(problem.to_owned())),
            None => Ok(()),
        }
    }

    fn registry(&self) -> &ConnectionRegistry {
        self.dispatcher.registry()
    }

    pub async fn find_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        self.store
            .find_one(Collection::Rooms, &Filter::by_id(room_id))
            .await?
            .map(|doc| from_document(&doc))
            .transpose()
    }

    pub async fn room(&self, room_id: &str) -> Result<Room, LobbyError> {
        self.find_room(room_id)
            .await?
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_owned()))
    }

    /// A missing room has no owner, so this is `false` rather than an error.
    pub async fn is_owner(&self, room_id: &str, email: &str) -> Result<bool, StoreError> {
        Ok(self
            .find_room(room_id)
            .await?
            .is_some_and(|room| room.owner_email == email))
    }

    pub async fn room_state(&self, room_id: &str) -> Result<RoomState, StoreError> {
        if self.find_room(room_id).await?.is_none() {
            return Ok(RoomState::Closed);
        }

        let games = self
            .store
            .count(Collection::Games, &Filter::eq("roomId", room_id))
            .await?;
        Ok(if games > 0 {
            RoomState::GameStarted
        } else {
            RoomState::Open
        })
    }

    /// Loads the room and checks `email` owns it.
    async fn owned_room(&self, room_id: &str, email: &str, action: &'static str) -> Result<Room, LobbyError> {
        let room = self.room(room_id).await?;
        if room.owner_email != email {
            return Err(LobbyError::NotOwner(action));
        }
        Ok(room)
    }

    pub async fn user_profile(&self, email: &str) -> Result<UserProfile, StoreError> {
        match self
            .store
            .find_one(Collection::Users, &Filter::eq("email", email))
            .await?
        {
            Some(doc) => from_document(&doc),
            None => Ok(UserProfile::anonymous(email)),
        }
    }

    pub async fn create_room(
        self: &Arc<Self>,
        owner_email: &str,
        request: RoomRequest,
    ) -> Result<Room, LobbyError> {
        Self::check_request(&request)?;
        let game_name = request
            .game_name
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(str::to_lowercase)
            .ok_or_else(|| LobbyError::InvalidRequest("gameName is required".to_owned()))?;

        let mut attempt = 0;
        let room = loop {
            attempt += 1;
            let room = request
                .clone()
                .into_room(new_room_id(), owner_email.to_owned(), game_name.clone());

            match self.store.insert_one(Collection::Rooms, to_document(&room)?).await {
                Ok(_) => break room,
                Err(StoreError::Duplicate { .. }) if attempt < ID_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        };

        info!(room_id = %room.id, game = %room.game_name, owner = %owner_email, "room created");
        self.watch_owner_arrival(&room);
        Ok(room)
    }

    pub async fn list_rooms(&self, game_name: &str) -> Result<Vec<Value>, StoreError> {
        let docs = self
            .store
            .find_many(
                Collection::Rooms,
                &Filter::eq("gameName", game_name.to_lowercase()),
                Some(ROOM_LIST_LIMIT),
            )
            .await?;

        docs.iter()
            .map(|doc| from_document::<Room>(doc).map(|room| room.public()))
            .collect()
    }

    /// Public room fields plus the owner's name, avatar and level in the room's game.
    pub async fn room_info(&self, room_id: &str) -> Result<Value, LobbyError> {
        let room = self.room(room_id).await?;
        let owner = self.user_profile(&room.owner_email).await?;

        let mut info = room.public();
        if let Value::Object(fields) = &mut info {
            fields.insert("ownerName".to_owned(), owner.name.clone().into());
            fields.insert("ownerAvatar".to_owned(), owner.avatar.clone().into());
            fields.insert("ownerLevel".to_owned(), owner.level_for(&room.game_name).into());
        }
        Ok(info)
    }

    pub async fn edit_room(&self, room_id: &str, email: &str, request: &RoomRequest) -> Result<Room, LobbyError> {
        let patch = request.patch();
        if patch.is_empty() {
            return Err(LobbyError::NoFieldsToUpdate);
        }
        Self::check_request(request)?;

        self.owned_room(room_id, email, "edit the room").await?;
        let updated = self
            .store
            .update_one(Collection::Rooms, room_id, patch)
            .await?
            .ok_or_else(|| LobbyError::RoomNotFound(room_id.to_owned()))?;

        debug!(room_id, "room edited");
        Ok(from_document(&updated)?)
    }

    pub async fn delete_room(&self, room_id: &str, email: &str) -> Result<(), LobbyError> {
        self.owned_room(room_id, email, "delete the room").await?;
        self.close_room(room_id).await?;
        Ok(())
    }

    /// Deletes the room, then its games and participation. `false` if it was already gone.
    ///
    /// The room goes first so its games are still present when the room delete is routed,
    /// leaving `game_ended` to the last game delete.
    pub async fn close_room(&self, room_id: &str) -> Result<bool, StoreError> {
        if self.store.delete_one(Collection::Rooms, room_id).await?.is_none() {
            debug!(room_id, "room already closed");
            return Ok(false);
        }
        self.joins.remove(room_id);

        let by_room = Filter::eq("roomId", room_id);
        let games = self.store.delete_many(Collection::Games, &by_room).await?;
        let participants = self
            .store
            .delete_many(Collection::Participation, &by_room)
            .await?;

        info!(room_id, games, participants, "room closed");
        Ok(true)
    }

    pub async fn start_game(&self, room_id: &str, email: &str) -> Result<Game, LobbyError> {
        let room = self.owned_room(room_id, email, "start a game").await?;

        let game = Game {
            // one running game per room
            id: room.id.clone(),
            room_id: room.id.clone(),
            game_name: room.game_name.clone(),
            status: GameStatus::Started,
            owner_id: email.to_owned(),
            winner_id: None,
            participants: vec![email.to_owned()],
        };

        match self.store.insert_one(Collection::Games, to_document(&game)?).await {
            Ok(_) => {}
            Err(StoreError::Duplicate { .. }) => {
                return Err(LobbyError::GameAlreadyStarted(room_id.to_owned()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(room_id, game = %game.game_name, "game started");
        self.dispatcher.publish(
            &Topic::room(room_id),
            &Event::new(EventType::GameStarted, game_payload(&game)),
        );
        Ok(game)
    }

    /// Marks the room's game ended, then removes it.
    pub async fn end_game(&self, room_id: &str, email: &str) -> Result<(), LobbyError> {
        self.owned_room(room_id, email, "end the game").await?;

        let mut status = Document::new();
        status.insert(
            "status".to_owned(),
            serde_json::to_value(GameStatus::Ended).map_err(StoreError::from)?,
        );
        if self.store.update_one(Collection::Games, room_id, status).await?.is_none() {
            return Err(LobbyError::NoGame(room_id.to_owned()));
        }

        let ended = self
            .store
            .delete_many(Collection::Games, &Filter::eq("roomId", room_id))
            .await?;
        if ended == 0 {
            return Err(LobbyError::NoGame(room_id.to_owned()));
        }

        info!(room_id, "game ended by owner");
        Ok(())
    }

    pub async fn participate(&self, room_id: &str, email: &str) -> Result<Participation, LobbyError> {
        let room = self.room(room_id).await?;
        let profile = self.user_profile(email).await?;

        let level = profile.level_for(&room.game_name);
        if level < room.min_level {
            return Err(LobbyError::LevelTooLow {
                have: level,
                need: room.min_level,
            });
        }

        let lock = self.join_lock(room_id);
        let _joining = lock.lock().await;
        let taken = self
            .store
            .count(Collection::Participation, &Filter::eq("roomId", room_id))
            .await?;
        if i64::try_from(taken).unwrap_or(i64::MAX) >= room.capacity {
            return Err(LobbyError::RoomFull(room_id.to_owned()));
        }

        let participation = Participation {
            id: Participation::record_id(room_id, email),
            user_id: email.to_owned(),
            room_id: room_id.to_owned(),
            user_name: profile.name,
            user_avatar: profile.avatar,
            user_level: level,
        };

        match self
            .store
            .insert_one(Collection::Participation, to_document(&participation)?)
            .await
        {
            Ok(_) => Ok(participation),
            Err(StoreError::Duplicate { .. }) => Err(LobbyError::AlreadyParticipating(room_id.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    /// Withdraws `email` from the room. When nobody is left, the room's games end.
    pub async fn cancel_participation(&self, room_id: &str, email: &str) -> Result<(), LobbyError> {
        let lock = self.join_lock(room_id);
        let _leaving = lock.lock().await;
        let removed = self
            .store
            .delete_one(Collection::Participation, &Participation::record_id(room_id, email))
            .await?;
        if removed.is_none() {
            debug!(room_id, user = %email, "was not participating");
            return Ok(());
        }

        let by_room = Filter::eq("roomId", room_id);
        if self.store.count(Collection::Participation, &by_room).await? == 0 {
            let games = self.store.delete_many(Collection::Games, &by_room).await?;
            if games > 0 {
                info!(room_id, "last participant left, game ended");
            }
        }
        Ok(())
    }

    pub async fn post_message(&self, room_id: &str, email: &str, content: &str) -> Result<Message, LobbyError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(LobbyError::InvalidRequest("message is empty".to_owned()));
        }

        let room = self.room(room_id).await?;
        if !room.text_chat_on {
            return Err(LobbyError::TextChatDisabled(room_id.to_owned()));
        }

        let profile = self.user_profile(email).await?;
        let message = Message {
            id: Uuid::now_v7().to_string(),
            room_id: room_id.to_owned(),
            user_id: email.to_owned(),
            user_name: profile.name,
            user_avatar: profile.avatar,
            content: content.to_owned(),
        };

        self.store
            .insert_one(Collection::Messages, to_document(&message)?)
            .await?;
        Ok(message)
    }

    async fn presence(&self, event_type: EventType, room_id: &str, email: &str) {
        let profile = match self.user_profile(email).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(room_id, user = %email, error = %e, "profile lookup failed");
                UserProfile::anonymous(email)
            }
        };

        self.dispatcher.publish(
            &Topic::room(room_id),
            &Event::new(
                event_type,
                json!({
                    "email": email,
                    "userName": profile.name,
                    "avatar": profile.avatar,
                }),
            ),
        );
    }

    pub async fn announce_join(&self, room_id: &str, email: &str) {
        self.presence(EventType::NewUser, room_id, email).await;
    }

    /// Presence and ownership checks for one torn-down connection.
    pub async fn connection_dropped(&self, dropped: DroppedConnection) {
        let email = dropped.connection.user_email();

        for topic in &dropped.topics {
            let Some(room_id) = topic.room_id() else {
                continue;
            };
            self.presence(EventType::UserLeft, room_id, email).await;

            if self.registry().user_present(topic, email) {
                continue;
            }
            match self.is_owner(room_id, email).await {
                Ok(true) => {
                    info!(room_id, owner = %email, "owner disconnected, closing room");
                    if let Err(e) = self.close_room(room_id).await {
                        warn!(room_id, error = %e, "failed to close room");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(room_id, error = %e, "ownership check failed"),
            }
        }
    }

    /// Handles teardown notices for the life of the process. The lifecycle's own dispatcher keeps
    /// the sending side alive, so the loop does not end on its own.
    pub async fn run(self: Arc<Self>, mut dropped: mpsc::UnboundedReceiver<DroppedConnection>) {
        while let Some(notice) = dropped.recv().await {
            debug!(conn_id = %notice.connection.id(), topics = notice.topics.len(), "teardown");
            self.connection_dropped(notice).await;
        }
        debug!("teardown channel closed");
    }

    /// Closes `room` if its owner has no socket on it once the grace period is over.
    fn watch_owner_arrival(self: &Arc<Self>, room: &Room) {
        if self.owner_grace.is_zero() {
            return;
        }

        let this = self.clone();
        let room_id = room.id.clone();
        let owner = room.owner_email.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.owner_grace).await;
            if this.registry().user_present(&Topic::room(&room_id), &owner) {
                return;
            }

            match this.close_room(&room_id).await {
                Ok(true) => info!(room_id, %owner, "owner never connected, room closed"),
                Ok(false) => {}
                Err(e) => warn!(room_id, error = %e, "failed to close abandoned room"),
            }
        });
    }
}
