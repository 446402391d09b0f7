//! Which live sockets care about which topics.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Interest group a socket can join.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    All,
    Game(String),
    Room(String),
}

impl Topic {
    /// Game topics are keyed by the lowercased game name.
    pub fn game(name: &str) -> Self {
        Topic::Game(name.to_lowercase())
    }

    pub fn room(id: impl Into<String>) -> Self {
        Topic::Room(id.into())
    }

    pub fn room_id(&self) -> Option<&str> {
        match self {
            Topic::Room(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Topic::All => f.write_str("all"),
            Topic::Game(name) => write!(f, "game:{name}"),
            Topic::Room(id) => write!(f, "room:{id}"),
        }
    }
}

/// A client socket as the rest of the server sees it: an outbound queue plus a close signal.
pub struct Connection {
    id: Uuid,
    user_email: String,
    tx: mpsc::Sender<Arc<String>>,
    closed: CancellationToken,
    connected_at: Instant,
    dropped_frames: AtomicU64,
}

impl Connection {
    pub fn new(user_email: impl Into<String>, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_email: user_email.into(),
            tx,
            closed: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_email(&self) -> &str {
        &self.user_email
    }

    /// Queues a frame without waiting. `false` when the queue is full or the socket is gone.
    pub fn send(&self, frame: Arc<String>) -> bool {
        if !self.is_closed() && self.tx.try_send(frame).is_ok() {
            return true;
        }
        let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        false
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_email", &self.user_email)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Topic membership for every live connection.
///
/// Locks are always taken memberships-first, then topics, and a topic's member map is only
/// touched under its shard lock, so `snapshot` never sees a half-applied change.
#[derive(Default)]
pub struct ConnectionRegistry {
    topics: DashMap<Topic, HashMap<Uuid, Arc<Connection>>>,
    memberships: DashMap<Uuid, HashSet<Topic>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to `topic`. Returns `false` if the connection is already closed.
    pub fn subscribe(&self, topic: Topic, conn: &Arc<Connection>) -> bool {
        let mut joined = self.memberships.entry(conn.id()).or_default();
        if conn.is_closed() {
            drop(joined);
            self.memberships.remove_if(&conn.id(), |_, topics| topics.is_empty());
            return false;
        }

        let _ = self
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(conn.id(), conn.clone());
        debug!(conn_id = %conn.id(), %topic, "subscribed");
        joined.insert(topic);
        true
    }

    pub fn unsubscribe(&self, topic: &Topic, conn: &Connection) {
        let Some(mut joined) = self.memberships.get_mut(&conn.id()) else {
            return;
        };
        if joined.remove(topic) {
            self.remove_member(topic, conn.id());
            debug!(conn_id = %conn.id(), %topic, "unsubscribed");
        }
    }

    pub fn snapshot(&self, topic: &Topic) -> Vec<Arc<Connection>> {
        self.topics
            .get(topic)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Closes `conn` and removes it everywhere. Only the first call gets the topics back.
    pub fn drop_connection(&self, conn: &Connection) -> Vec<Topic> {
        conn.close();
        let Some((_, joined)) = self.memberships.remove(&conn.id()) else {
            return Vec::new();
        };

        for topic in &joined {
            self.remove_member(topic, conn.id());
        }
        debug!(conn_id = %conn.id(), topics = joined.len(), "connection dropped");
        joined.into_iter().collect()
    }

    pub fn topics_of(&self, conn: &Connection) -> Vec<Topic> {
        self.memberships
            .get(&conn.id())
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `email` has a live connection on `topic`.
    pub fn user_present(&self, topic: &Topic, email: &str) -> bool {
        self.topics.get(topic).is_some_and(|members| {
            members
                .values()
                .any(|conn| conn.user_email() == email && !conn.is_closed())
        })
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.get(topic).map(|members| members.len()).unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.memberships.len()
    }

    fn remove_member(&self, topic: &Topic, id: Uuid) {
        if let Some(mut members) = self.topics.get_mut(topic) {
            members.remove(&id);
        }
        self.topics.remove_if(topic, |_, members| members.is_empty());
    }
}
