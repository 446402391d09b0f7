use std::collections::HashMap;

use rand::{Rng, distr::Alphanumeric};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::store::{Document, StoreError};

pub const DEFAULT_CAPACITY: i64 = 8;

fn default_true() -> bool {
    true
}

fn default_capacity() -> i64 {
    DEFAULT_CAPACITY
}

/// Nine alphanumeric characters, the id format clients already link to.
pub fn new_room_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(char::from)
        .collect()
}

pub fn to_document<T: Serialize>(value: &T) -> Result<Document, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(doc) => Ok(doc),
        _ => Err(StoreError::MissingField("id")),
    }
}

pub fn from_document<T: DeserializeOwned>(doc: &Document) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(doc.clone()))?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub game_name: String,
    pub owner_email: String,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub voice_chat_on: bool,
    #[serde(default = "default_true")]
    pub text_chat_on: bool,
    #[serde(default)]
    pub min_level: i64,
    #[serde(default = "default_capacity")]
    pub capacity: i64,
    #[serde(default)]
    pub settings: Value,
}

/// The part of a room that members see change in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub is_locked: bool,
    pub voice_chat_on: bool,
    pub text_chat_on: bool,
    pub min_level: i64,
    pub capacity: i64,
    pub settings: Value,
}

impl Room {
    pub fn settings(&self) -> RoomSettings {
        RoomSettings {
            is_locked: self.is_locked,
            voice_chat_on: self.voice_chat_on,
            text_chat_on: self.text_chat_on,
            min_level: self.min_level,
            capacity: self.capacity,
            settings: self.settings.clone(),
        }
    }

    /// Lobby view: everything except the password.
    pub fn public(&self) -> Value {
        let mut view = serde_json::to_value(self).unwrap_or_default();
        if let Value::Object(fields) = &mut view {
            fields.remove("password");
        }
        view
    }
}

/// `Ended` is written just before a game document is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Started,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    pub room_id: String,
    pub game_name: String,
    pub status: GameStatus,
    pub owner_id: String,
    #[serde(default)]
    pub winner_id: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participation {
    pub id: String,
    pub user_id: String,
    pub room_id: String,
    pub user_name: String,
    #[serde(default)]
    pub user_avatar: String,
    #[serde(default)]
    pub user_level: i64,
}

impl Participation {
    /// One record per user per room.
    pub fn record_id(room_id: &str, user_id: &str) -> String {
        format!("{room_id}:{user_id}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub user_avatar: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameStats {
    #[serde(default)]
    pub wins: i64,
    #[serde(default)]
    pub level: i64,
}

/// Read-only profile owned by the account service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub games: HashMap<String, GameStats>,
}

impl UserProfile {
    /// Stand-in for users the account service has no profile for.
    pub fn anonymous(email: &str) -> Self {
        Self {
            email: email.to_owned(),
            name: email.to_owned(),
            ..Self::default()
        }
    }

    pub fn level_for(&self, game_name: &str) -> i64 {
        self.games.get(game_name).map(|s| s.level).unwrap_or_default()
    }
}

/// Inbound room body. Absent fields leave the room unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub game_name: Option<String>,
    pub is_locked: Option<bool>,
    pub room_password: Option<String>,
    pub voice_chat_on: Option<bool>,
    pub text_chat_on: Option<bool>,
    pub min_level: Option<i64>,
    pub capacity: Option<i64>,
    pub settings: Option<Value>,
    pub message: Option<String>,
}

impl RoomRequest {
    /// Store patch holding only the fields that were sent.
    pub fn patch(&self) -> Document {
        let mut patch = Document::new();
        let mut set = |field: &str, value: Option<Value>| {
            if let Some(value) = value {
                patch.insert(field.to_owned(), value);
            }
        };

        set("gameName", self.game_name.as_deref().map(|g| g.trim().to_lowercase().into()));
        set("isLocked", self.is_locked.map(Value::from));
        set("password", self.room_password.clone().map(Value::from));
        set("voiceChatOn", self.voice_chat_on.map(Value::from));
        set("textChatOn", self.text_chat_on.map(Value::from));
        set("minLevel", self.min_level.map(Value::from));
        set("capacity", self.capacity.map(Value::from));
        set("settings", self.settings.clone());

        patch
    }

    /// First sent field that cannot be stored, for both create and edit.
    pub fn invalid_field(&self) -> Option<&'static str> {
        if self.game_name.as_deref().is_some_and(|g| g.trim().is_empty()) {
            return Some("gameName must not be blank");
        }
        if self.capacity.is_some_and(|c| c < 0) {
            return Some("capacity must not be negative");
        }
        if self.min_level.is_some_and(|l| l < 0) {
            return Some("minLevel must not be negative");
        }
        None
    }

    pub fn into_room(self, id: String, owner_email: String, game_name: String) -> Room {
        Room {
            id,
            game_name,
            owner_email,
            is_locked: self.is_locked.unwrap_or_default(),
            password: self.room_password.filter(|p| !p.is_empty()),
            voice_chat_on: self.voice_chat_on.unwrap_or_default(),
            text_chat_on: self.text_chat_on.unwrap_or(true),
            min_level: self.min_level.unwrap_or_default(),
            capacity: self.capacity.unwrap_or(DEFAULT_CAPACITY),
            settings: self.settings.unwrap_or(Value::Object(Default::default())),
        }
    }
}
