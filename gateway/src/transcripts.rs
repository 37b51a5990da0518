use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("Transcript database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Transcript encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    /// `user` or `assistant`
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub chat_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub messages: Vec<TranscriptMessage>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptSummary {
    pub chat_id: String,
    pub title: Option<String>,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&Transcript> for TranscriptSummary {
    fn from(t: &Transcript) -> Self {
        Self {
            chat_id: t.chat_id.clone(),
            title: t.title.clone(),
            message_count: t.messages.len(),
            updated_at: t.updated_at,
        }
    }
}

/// Chat transcripts keyed by `(user_id, chat_id)`.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn load(&self, user_id: &str, chat_id: &str)
        -> Result<Option<Transcript>, TranscriptError>;

    /// Insert or replace the transcript for `(user_id, transcript.chat_id)`.
    async fn save(&self, user_id: &str, transcript: &Transcript) -> Result<(), TranscriptError>;

    /// Most recently updated first.
    async fn list(&self, user_id: &str) -> Result<Vec<TranscriptSummary>, TranscriptError>;
}

/// SQLite-backed store sharing the gateway's pool. Schema lives in
/// `migrations/`.
#[derive(Debug, Clone)]
pub struct SqliteTranscriptStore {
    pool: SqlitePool,
}

impl SqliteTranscriptStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TranscriptStore for SqliteTranscriptStore {
    async fn load(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<Transcript>, TranscriptError> {
        let row: Option<(Option<String>, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT title, messages, updated_at FROM transcripts WHERE user_id = ? AND chat_id = ?",
        )
        .bind(user_id)
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((title, messages, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Transcript {
            chat_id: chat_id.to_string(),
            title,
            messages: serde_json::from_str(&messages)?,
            updated_at,
        }))
    }

    async fn save(&self, user_id: &str, transcript: &Transcript) -> Result<(), TranscriptError> {
        let messages = serde_json::to_string(&transcript.messages)?;

        sqlx::query(
            "INSERT INTO transcripts (user_id, chat_id, title, messages, message_count, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, chat_id) DO UPDATE SET
                title = excluded.title,
                messages = excluded.messages,
                message_count = excluded.message_count,
                updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(&transcript.chat_id)
        .bind(&transcript.title)
        .bind(messages)
        .bind(transcript.messages.len() as i64)
        .bind(transcript.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<TranscriptSummary>, TranscriptError> {
        let rows: Vec<(String, Option<String>, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT chat_id, title, message_count, updated_at FROM transcripts
             WHERE user_id = ? ORDER BY updated_at DESC, chat_id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(chat_id, title, count, updated_at)| TranscriptSummary {
                chat_id,
                title,
                message_count: count.max(0) as usize,
                updated_at,
            })
            .collect())
    }
}

/// In-process store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryTranscriptStore {
    chats: RwLock<HashMap<(String, String), Transcript>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for MemoryTranscriptStore {
    async fn load(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<Transcript>, TranscriptError> {
        Ok(self
            .chats
            .read()
            .await
            .get(&(user_id.to_string(), chat_id.to_string()))
            .cloned())
    }

    async fn save(&self, user_id: &str, transcript: &Transcript) -> Result<(), TranscriptError> {
        self.chats.write().await.insert(
            (user_id.to_string(), transcript.chat_id.clone()),
            transcript.clone(),
        );
        Ok(())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<TranscriptSummary>, TranscriptError> {
        let chats = self.chats.read().await;
        let mut out: Vec<TranscriptSummary> = chats
            .iter()
            .filter(|((owner, _), _)| owner == user_id)
            .map(|(_, t)| TranscriptSummary::from(t))
            .collect();
        out.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.chat_id.cmp(&b.chat_id))
        });
        Ok(out)
    }
}
