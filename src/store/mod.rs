//! Document store seam: the handful of reads, writes and change feeds the lobby needs.

mod sqlite;

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};

pub use sqlite::SqliteStore;

/// A stored document, always a JSON object carrying a string `id`.
pub type Document = Map<String, Value>;

/// Ordered, per-collection feed of mutations.
pub type MutationStream = BoxStream<'static, Result<Mutation, StoreError>>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("document {collection}/{id} already exists")]
    Duplicate { collection: Collection, id: String },
    #[error("document is missing string field `{0}`")]
    MissingField(&'static str),
    #[error("change feed fell behind by {0} events")]
    WatchLagged(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Rooms,
    Games,
    Messages,
    Participation,
    Users,
}

impl Collection {
    /// Collections with a change observer attached.
    pub const WATCHED: [Collection; 4] = [
        Collection::Rooms,
        Collection::Games,
        Collection::Participation,
        Collection::Messages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Rooms => "rooms",
            Collection::Games => "games",
            Collection::Messages => "messages",
            Collection::Participation => "participated",
            Collection::Users => "users",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conjunction of top-level field equalities.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<String>) -> Self {
        Self::eq("id", id.into())
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| doc.get(field) == Some(value))
    }
}

/// One observed change. `previous == None` is a create, `current == None` a delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub collection: Collection,
    pub previous: Option<Document>,
    pub current: Option<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl Mutation {
    pub fn kind(&self) -> Option<MutationKind> {
        match (&self.previous, &self.current) {
            (None, Some(_)) => Some(MutationKind::Create),
            (Some(_), Some(_)) => Some(MutationKind::Update),
            (Some(_), None) => Some(MutationKind::Delete),
            (None, None) => None,
        }
    }

    /// The most recent snapshot: `current`, or `previous` for deletes.
    pub fn latest(&self) -> Option<&Document> {
        self.current.as_ref().or(self.previous.as_ref())
    }
}

pub trait GetField {
    fn get_str_field(&self, field: &'static str) -> Result<&str, StoreError>;
}

impl GetField for Document {
    fn get_str_field(&self, field: &'static str) -> Result<&str, StoreError> {
        self.get(field)
            .and_then(Value::as_str)
            .ok_or(StoreError::MissingField(field))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find_one(&self, collection: Collection, filter: &Filter)
    -> Result<Option<Document>, StoreError>;

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError>;

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<usize, StoreError>;

    /// Inserts `doc`, assigning a v7 UUID when it carries no `id`.
    async fn insert_one(&self, collection: Collection, doc: Document)
    -> Result<Document, StoreError>;

    /// Merges `patch` into the top level of the document. `None` when it does not exist.
    async fn update_one(
        &self,
        collection: Collection,
        id: &str,
        patch: Document,
    ) -> Result<Option<Document>, StoreError>;

    /// Returns the deleted document, `None` when it was already gone.
    async fn delete_one(&self, collection: Collection, id: &str)
    -> Result<Option<Document>, StoreError>;

    async fn delete_many(&self, collection: Collection, filter: &Filter)
    -> Result<usize, StoreError>;

    /// Subscribes to the collection's change feed. Only changes committed after the call are seen.
    fn watch(&self, collection: Collection) -> MutationStream;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn classifies_mutations() {
        let room = doc(json!({"id": "R1"}));
        let create = Mutation { collection: Collection::Rooms, previous: None, current: Some(room.clone()) };
        let update = Mutation { collection: Collection::Rooms, previous: Some(room.clone()), current: Some(room.clone()) };
        let delete = Mutation { collection: Collection::Rooms, previous: Some(room), current: None };
        let empty = Mutation { collection: Collection::Rooms, previous: None, current: None };

        assert_eq!(create.kind(), Some(MutationKind::Create));
        assert_eq!(update.kind(), Some(MutationKind::Update));
        assert_eq!(delete.kind(), Some(MutationKind::Delete));
        assert_eq!(empty.kind(), None);
        assert_eq!(delete.latest().unwrap()["id"], "R1");
    }

    #[test]
    fn filter_matches_every_clause() {
        let game = doc(json!({"id": "g1", "roomId": "R1", "status": "started"}));
        assert!(Filter::eq("roomId", "R1").matches(&game));
        assert!(Filter::eq("roomId", "R1").and("status", "started").matches(&game));
        assert!(!Filter::eq("roomId", "R1").and("status", "ended").matches(&game));
        assert!(Filter::all().matches(&game));
    }

    #[test]
    fn missing_string_field() {
        let d = doc(json!({"id": 7}));
        assert!(matches!(d.get_str_field("id"), Err(StoreError::MissingField("id"))));
        assert!(d.get_str_field("roomId").is_err());
    }
}
