use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions};
use tokio::sync::{Mutex, broadcast, broadcast::error::RecvError};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Collection, Document, DocumentStore, Filter, GetField, Mutation, MutationStream, StoreError,
};

const ALL_COLLECTIONS: [Collection; 5] = [
    Collection::Rooms,
    Collection::Games,
    Collection::Messages,
    Collection::Participation,
    Collection::Users,
];

/// Documents as JSON text in a single SQLite table, with an in-process change feed per collection.
///
/// Every write takes `write_lock` and publishes its mutation before releasing it, so the order
/// watchers observe is the commit order.
pub struct SqliteStore {
    pool: SqlitePool,
    feeds: HashMap<Collection, broadcast::Sender<Mutation>>,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, feed_capacity: usize) -> Self {
        let feeds = ALL_COLLECTIONS
            .into_iter()
            .map(|collection| (collection, broadcast::channel(feed_capacity.max(1)).0))
            .collect();

        Self {
            pool,
            feeds,
            write_lock: Mutex::new(()),
        }
    }

    /// A private in-memory database on one long-lived connection.
    pub async fn in_memory(feed_capacity: usize) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool, feed_capacity);
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )",
        )
        .execute(&self.pool)
        .await?;

        info!("document store ready");
        Ok(())
    }

    async fn fetch(&self, collection: Collection, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| parse_body(&row.try_get::<String, _>("body")?))
            .transpose()
    }

    async fn select(
        &self,
        collection: Collection,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        let (mut sql, binds) = filtered("SELECT body", collection, filter);
        sql.push_str(" ORDER BY rowid");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind.as_str());
        }

        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| parse_body(&row.try_get::<String, _>("body")?))
            .collect()
    }

    fn publish(&self, mutation: Mutation) {
        let Some(feed) = self.feeds.get(&mutation.collection) else {
            return;
        };
        let collection = mutation.collection;
        // no receivers just means nobody is watching yet
        let watchers = feed.send(mutation).unwrap_or(0);
        debug!(%collection, watchers, "published mutation");
    }
}

fn parse_body(body: &str) -> Result<Document, StoreError> {
    Ok(serde_json::from_str(body)?)
}

/// Builds `<head> FROM documents WHERE ...` with one bind per placeholder.
fn filtered(head: &str, collection: Collection, filter: &Filter) -> (String, Vec<String>) {
    let mut sql = format!("{head} FROM documents WHERE collection = ?");
    let mut binds = vec![collection.as_str().to_owned()];

    for (field, value) in filter.clauses() {
        sql.push_str(" AND json_extract(body, ?) = json_extract(?, '$')");
        binds.push(format!("$.\"{field}\""));
        binds.push(value.to_string());
    }

    (sql, binds)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self.select(collection, filter, Some(1)).await?.into_iter().next())
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        self.select(collection, filter, limit).await
    }

    async fn count(&self, collection: Collection, filter: &Filter) -> Result<usize, StoreError> {
        let (sql, binds) = filtered("SELECT COUNT(*) AS n", collection, filter);

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind.as_str());
        }

        let n: i64 = query.fetch_one(&self.pool).await?.try_get("n")?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    async fn insert_one(
        &self,
        collection: Collection,
        mut doc: Document,
    ) -> Result<Document, StoreError> {
        let id = match doc.get("id").and_then(Value::as_str) {
            Some(id) => id.to_owned(),
            None => {
                let id = Uuid::now_v7().to_string();
                doc.insert("id".to_owned(), Value::String(id.clone()));
                id
            }
        };
        let body = serde_json::to_string(&doc)?;

        let _guard = self.write_lock.lock().await;
        let inserted = sqlx::query("INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)")
            .bind(collection.as_str())
            .bind(&id)
            .bind(&body)
            .execute(&self.pool)
            .await;

        if let Err(sqlx::Error::Database(e)) = &inserted {
            if e.is_unique_violation() {
                return Err(StoreError::Duplicate { collection, id });
            }
        }
        inserted?;

        self.publish(Mutation {
            collection,
            previous: None,
            current: Some(doc.clone()),
        });
        Ok(doc)
    }

    async fn update_one(
        &self,
        collection: Collection,
        id: &str,
        patch: Document,
    ) -> Result<Option<Document>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.fetch(collection, id).await? else {
            return Ok(None);
        };

        let mut current = previous.clone();
        for (field, value) in patch {
            if field != "id" {
                current.insert(field, value);
            }
        }

        sqlx::query("UPDATE documents SET body = ? WHERE collection = ? AND id = ?")
            .bind(serde_json::to_string(&current)?)
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.publish(Mutation {
            collection,
            previous: Some(previous),
            current: Some(current.clone()),
        });
        Ok(Some(current))
    }

    async fn delete_one(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.fetch(collection, id).await? else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        self.publish(Mutation {
            collection,
            previous: Some(previous.clone()),
            current: None,
        });
        Ok(Some(previous))
    }

    async fn delete_many(&self, collection: Collection, filter: &Filter) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let doomed = self.select(collection, filter, None).await?;

        for previous in &doomed {
            sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                .bind(collection.as_str())
                .bind(previous.get_str_field("id")?)
                .execute(&self.pool)
                .await?;

            self.publish(Mutation {
                collection,
                previous: Some(previous.clone()),
                current: None,
            });
        }

        Ok(doomed.len())
    }

    fn watch(&self, collection: Collection) -> MutationStream {
        let Some(feed) = self.feeds.get(&collection) else {
            return stream::empty().boxed();
        };

        stream::unfold(feed.subscribe(), |mut rx| async move {
            match rx.recv().await {
                Ok(mutation) => Some((Ok(mutation), rx)),
                Err(RecvError::Lagged(missed)) => Some((Err(StoreError::WatchLagged(missed)), rx)),
                Err(RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_find_and_count() {
        let store = SqliteStore::in_memory(16).await.unwrap();
        store.insert_one(Collection::Rooms, doc(json!({"id": "R1", "gameName": "uno"}))).await.unwrap();
        store.insert_one(Collection::Rooms, doc(json!({"id": "R2", "gameName": "uno"}))).await.unwrap();
        store.insert_one(Collection::Rooms, doc(json!({"id": "R3", "gameName": "chess"}))).await.unwrap();

        let found = store.find_one(Collection::Rooms, &Filter::by_id("R2")).await.unwrap().unwrap();
        assert_eq!(found["gameName"], "uno");
        assert_eq!(store.count(Collection::Rooms, &Filter::eq("gameName", "uno")).await.unwrap(), 2);
        assert_eq!(store.count(Collection::Games, &Filter::all()).await.unwrap(), 0);

        let limited = store.find_many(Collection::Rooms, &Filter::all(), Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0]["id"], "R1");
    }

    #[tokio::test]
    async fn filters_on_booleans_and_numbers() {
        let store = SqliteStore::in_memory(16).await.unwrap();
        store.insert_one(Collection::Rooms, doc(json!({"id": "R1", "isLocked": true, "capacity": 4}))).await.unwrap();
        store.insert_one(Collection::Rooms, doc(json!({"id": "R2", "isLocked": false, "capacity": 4}))).await.unwrap();

        let locked = store.find_many(Collection::Rooms, &Filter::eq("isLocked", true), None).await.unwrap();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0]["id"], "R1");
        assert_eq!(store.count(Collection::Rooms, &Filter::eq("capacity", 4)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn insert_assigns_id_and_rejects_duplicates() {
        let store = SqliteStore::in_memory(16).await.unwrap();
        let message = store.insert_one(Collection::Messages, doc(json!({"content": "hi"}))).await.unwrap();
        assert!(message["id"].as_str().is_some());

        store.insert_one(Collection::Rooms, doc(json!({"id": "R1"}))).await.unwrap();
        let err = store.insert_one(Collection::Rooms, doc(json!({"id": "R1"}))).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn update_merges_top_level_fields() {
        let store = SqliteStore::in_memory(16).await.unwrap();
        store.insert_one(Collection::Rooms, doc(json!({"id": "R1", "capacity": 4, "isLocked": false}))).await.unwrap();

        let updated = store
            .update_one(Collection::Rooms, "R1", doc(json!({"capacity": 8, "id": "nope"})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated["capacity"], 8);
        assert_eq!(updated["isLocked"], false);
        assert_eq!(updated["id"], "R1");

        assert!(store.update_one(Collection::Rooms, "missing", Document::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_returns_previous_once() {
        let store = SqliteStore::in_memory(16).await.unwrap();
        store.insert_one(Collection::Rooms, doc(json!({"id": "R1"}))).await.unwrap();

        assert!(store.delete_one(Collection::Rooms, "R1").await.unwrap().is_some());
        assert!(store.delete_one(Collection::Rooms, "R1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_sees_writes_in_commit_order() {
        let store = SqliteStore::in_memory(16).await.unwrap();
        let mut feed = store.watch(Collection::Games);

        store.insert_one(Collection::Games, doc(json!({"id": "g1", "roomId": "R1"}))).await.unwrap();
        store.insert_one(Collection::Games, doc(json!({"id": "g2", "roomId": "R1"}))).await.unwrap();
        store.update_one(Collection::Games, "g1", doc(json!({"status": "ended"}))).await.unwrap();
        assert_eq!(store.delete_many(Collection::Games, &Filter::eq("roomId", "R1")).await.unwrap(), 2);
        // other collections stay on their own feed
        store.insert_one(Collection::Rooms, doc(json!({"id": "R1"}))).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            let mutation = feed.next().await.unwrap().unwrap();
            seen.push((mutation.kind().unwrap(), mutation.latest().unwrap()["id"].clone()));
        }

        use crate::store::MutationKind::*;
        assert_eq!(
            seen,
            vec![
                (Create, json!("g1")),
                (Create, json!("g2")),
                (Update, json!("g1")),
                (Delete, json!("g1")),
                (Delete, json!("g2")),
            ]
        );
    }

    #[tokio::test]
    async fn lagging_watcher_gets_an_error() {
        let store = SqliteStore::in_memory(1).await.unwrap();
        let mut feed = store.watch(Collection::Messages);

        for n in 0..3 {
            store.insert_one(Collection::Messages, doc(json!({"id": format!("m{n}")}))).await.unwrap();
        }

        assert!(matches!(feed.next().await, Some(Err(StoreError::WatchLagged(_)))));
    }
}
