//! Append-only chat log on SQLite.

use std::{str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use tokio::sync::Mutex;

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    File,
}

impl MessageKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::File => "file",
        }
    }

    fn from_column(value: &str) -> Self {
        match value {
            "file" => Self::File,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub username: String,
    pub content: String,
    /// Milliseconds since the unix epoch, assigned on append.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub file_payload: Option<String>,
}

type MessageRow = (i64, String, String, i64, String, Option<String>);

impl From<MessageRow> for Message {
    fn from((id, username, content, timestamp, kind, file_payload): MessageRow) -> Self {
        Self {
            id,
            username,
            content,
            timestamp,
            kind: MessageKind::from_column(&kind),
            file_payload,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message log unavailable: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct MessageLog {
    pool: SqlitePool,
    /// Serializes appends and remembers the newest timestamp handed out.
    last_timestamp: Arc<Mutex<i64>>,
}

impl MessageLog {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // every connection to :memory: is its own database, so keep exactly one alive forever
        let pool_options = if database_url.contains(":memory:") || database_url.contains("mode=memory") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(16)
        };
        let pool = pool_options.connect_with(options).await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                type TEXT NOT NULL DEFAULT 'text',
                file_payload TEXT
            )",
        )
        .execute(&pool)
        .await?;

        let (last_timestamp,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(timestamp), 0) FROM messages")
                .fetch_one(&pool)
                .await?;

        Ok(Self {
            pool,
            last_timestamp: Arc::new(Mutex::new(last_timestamp)),
        })
    }

    /// Persists a message and returns it with its id and timestamp filled in.
    ///
    /// On error nothing was stored and the message must not be shown to anyone.
    pub async fn append(
        &self,
        author: &str,
        content: &str,
        kind: MessageKind,
        file_payload: Option<&str>,
    ) -> Result<Message, StoreError> {
        let file_payload = match kind {
            MessageKind::File => file_payload.map(str::to_owned),
            MessageKind::Text => None,
        };

        let mut last_timestamp = self.last_timestamp.lock().await;
        let timestamp = now_millis().max(*last_timestamp);

        let result = sqlx::query(
            "INSERT INTO messages (username,content,timestamp,type,file_payload) VALUES (?,?,?,?,?)",
        )
        .bind(author)
        .bind(content)
        .bind(timestamp)
        .bind(kind.as_str())
        .bind(file_payload.as_deref())
        .execute(&self.pool)
        .await?;

        *last_timestamp = timestamp;

        Ok(Message {
            id: result.last_insert_rowid(),
            username: author.to_owned(),
            content: content.to_owned(),
            timestamp,
            kind,
            file_payload,
        })
    }

    /// Up to `limit` newest messages, oldest first.
    pub async fn recent_messages(&self, limit: u32) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id,username,content,timestamp,type,file_payload FROM (
                SELECT * FROM messages ORDER BY id DESC LIMIT ?
            ) ORDER BY id ASC",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
