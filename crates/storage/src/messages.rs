use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use gymdesk_core::OutgoingMessage;
use serde::Serialize;
use sqlx::FromRow;

use crate::StoragePool;

#[derive(Clone)]
pub struct MessageRepository {
    pool: StoragePool,
}

/// A persisted message row. Immutable once written.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MessageRecord {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub message: Option<String>,
    pub file_url: Option<String>,
    pub voice_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Fields of a message row before the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: i64,
    pub receiver_id: i64,
    pub message: Option<String>,
    pub file_url: Option<String>,
    pub voice_url: Option<String>,
}

impl From<&OutgoingMessage> for NewMessage {
    fn from(payload: &OutgoingMessage) -> Self {
        Self {
            sender_id: payload.sender_id,
            receiver_id: payload.receiver_id,
            message: payload.message.clone(),
            file_url: payload.file_url.clone(),
            voice_url: payload.voice_url.clone(),
        }
    }
}

impl MessageRepository {
    pub fn new(pool: StoragePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Append a message. The database assigns both `id` and `timestamp`.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord> {
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"
            INSERT INTO messages (sender_id, receiver_id, message, file_url, voice_url)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, sender_id, receiver_id, message, file_url, voice_url, "timestamp"
            "#,
        )
        .bind(message.sender_id)
        .bind(message.receiver_id)
        .bind(message.message.as_deref())
        .bind(message.file_url.as_deref())
        .bind(message.voice_url.as_deref())
        .fetch_one(self.pool.pool())
        .await?;
        Ok(record)
    }

    /// Everything two actors exchanged, in either direction, oldest first.
    /// `id` breaks ties between rows sharing a timestamp.
    pub async fn conversation_between(
        &self,
        actor_a: i64,
        actor_b: i64,
    ) -> Result<Vec<MessageRecord>> {
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, sender_id, receiver_id, message, file_url, voice_url, "timestamp"
            FROM messages
            WHERE (sender_id = $1 AND receiver_id = $2)
               OR (sender_id = $2 AND receiver_id = $1)
            ORDER BY "timestamp" ASC, id ASC
            "#,
        )
        .bind(actor_a)
        .bind(actor_b)
        .fetch_all(self.pool.pool())
        .await?;
        Ok(records)
    }
}
