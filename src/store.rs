use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::identity::Identity;

/// A durably recorded chat message. The store assigns id and
/// timestamp; the gateway only ever holds a transient copy of this
/// for the duration of a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub room_id: String,
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Collaborator seam for message persistence.
///
/// `append_fast` is the real-time path: a single INSERT with the
/// author identity taken from the already-verified connection, no
/// room-existence or membership lookups. Those were enforced when the
/// connection joined the room; the request/response history API keeps
/// its own slow path that re-validates per call.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_fast(
        &self,
        room_id: &str,
        author: &Identity,
        content: &str,
    ) -> Result<Message, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

pub struct SqliteMessageStore {
    db_pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append_fast(
        &self,
        room_id: &str,
        author: &Identity,
        content: &str,
    ) -> Result<Message, StoreError> {
        let id = Uuid::now_v7();
        let created_at = now_rfc3339();

        sqlx::query(
            "INSERT INTO messages (id, room_id, author_id, author_username, content, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(room_id)
        .bind(&author.id)
        .bind(&author.username)
        .bind(content)
        .bind(&created_at)
        .execute(&self.db_pool)
        .await?;

        Ok(Message {
            id,
            room_id: room_id.to_owned(),
            author_id: author.id.clone(),
            author_username: author.username.clone(),
            content: content.to_owned(),
            created_at,
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        let row: Option<(String, String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, room_id, author_id, author_username, content, created_at \
             FROM messages WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.db_pool)
        .await?;

        match row {
            Some((id, room_id, author_id, author_username, content, created_at)) => {
                Ok(Some(Message {
                    id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                    room_id,
                    author_id,
                    author_username,
                    content,
                    created_at,
                }))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}

pub async fn init_schema(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (\
            id TEXT PRIMARY KEY,\
            username TEXT NOT NULL UNIQUE\
        )",
    )
    .execute(db_pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS auth_tokens (\
            token TEXT PRIMARY KEY,\
            user_id TEXT NOT NULL REFERENCES users(id),\
            expires_at TEXT NOT NULL\
        )",
    )
    .execute(db_pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (\
            id TEXT PRIMARY KEY,\
            room_id TEXT NOT NULL,\
            author_id TEXT NOT NULL,\
            author_username TEXT NOT NULL,\
            content TEXT NOT NULL,\
            created_at TEXT NOT NULL\
        )",
    )
    .execute(db_pool)
    .await?;

    Ok(())
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("rfc3339 formatting of the current time")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteMessageStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        SqliteMessageStore::new(pool)
    }

    fn alice() -> Identity {
        Identity {
            id: "user-1".to_string(),
            username: "alice".to_string(),
        }
    }

    #[tokio::test]
    async fn append_fast_assigns_id_and_timestamp() {
        let store = store().await;

        let message = store.append_fast("general", &alice(), "hi").await.unwrap();
        assert_eq!(message.room_id, "general");
        assert_eq!(message.author_username, "alice");
        assert_eq!(message.content, "hi");
        assert!(!message.created_at.is_empty());

        let found = store.find_by_id(message.id).await.unwrap();
        assert_eq!(found, Some(message));
    }

    #[tokio::test]
    async fn append_order_is_preserved_per_room() {
        let store = store().await;

        let first = store.append_fast("general", &alice(), "one").await.unwrap();
        let second = store.append_fast("general", &alice(), "two").await.unwrap();

        // v7 ids are time-ordered, so append order is recoverable.
        assert!(first.id < second.id);
    }

    #[tokio::test]
    async fn delete_removes_message() {
        let store = store().await;

        let message = store.append_fast("general", &alice(), "hi").await.unwrap();
        store.delete(message.id).await.unwrap();

        assert_eq!(store.find_by_id(message.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn find_unknown_id_is_none() {
        let store = store().await;
        assert_eq!(store.find_by_id(Uuid::now_v7()).await.unwrap(), None);
    }
}
