//! PostgreSQL conversation store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rootcause::Report;
use speda_conversation::message::{Attachment, ToolCallRecord};
use speda_conversation::store::preview_of;
use speda_conversation::{
    ConversationStore, ConversationSummary, Message, MessageRole, StoreError,
};
use speda_core::{ConversationId, MessageId, UserId};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

fn storage_failed(err: sqlx::Error) -> Report<StoreError> {
    StoreError::StorageFailed {
        reason: err.to_string(),
    }
    .into()
}

fn invalid_data(reason: String) -> Report<StoreError> {
    StoreError::InvalidData { reason }.into()
}

/// Row type for conversation summary queries.
#[derive(FromRow)]
struct SummaryRow {
    id: String,
    owner_id: String,
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    message_count: i64,
    first_message: Option<String>,
}

impl SummaryRow {
    fn try_into_summary(self) -> Result<ConversationSummary, Report<StoreError>> {
        let id = ConversationId::from_str(&self.id)
            .map_err(|e| invalid_data(format!("conversation id '{}': {e}", self.id)))?;
        let owner = UserId::from_str(&self.owner_id)
            .map_err(|e| invalid_data(format!("owner id '{}': {e}", self.owner_id)))?;

        Ok(ConversationSummary {
            id,
            owner,
            title: self.title,
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: usize::try_from(self.message_count).unwrap_or_default(),
            preview: self.first_message.as_deref().map(preview_of),
        })
    }
}

/// Row type for message queries.
#[derive(FromRow)]
struct MessageRow {
    id: String,
    role: String,
    content: String,
    attachments: Json<Vec<Attachment>>,
    tool_call: Option<Json<ToolCallRecord>>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn try_into_message(self) -> Result<Message, Report<StoreError>> {
        let id = MessageId::from_str(&self.id)
            .map_err(|e| invalid_data(format!("message id '{}': {e}", self.id)))?;
        let role = MessageRole::from_str(&self.role).map_err(invalid_data)?;

        Ok(Message {
            id,
            role,
            content: self.content,
            attachments: self.attachments.0,
            tool_call: self.tool_call.map(|call| call.0),
            created_at: self.created_at,
        })
    }
}

const SUMMARY_SELECT: &str = r#"
    SELECT c.id, c.owner_id, c.title, c.created_at, c.updated_at,
           (SELECT COUNT(*) FROM conversation_messages m
            WHERE m.conversation_id = c.id) AS message_count,
           (SELECT m.content FROM conversation_messages m
            WHERE m.conversation_id = c.id
            ORDER BY m.seq ASC LIMIT 1) AS first_message
    FROM conversations c
"#;

/// Conversation store backed by PostgreSQL.
///
/// Appends lock the conversation row first, so concurrent appends to one
/// conversation are serialized and receive consecutive sequence numbers.
#[derive(Debug, Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: ConversationId) -> Result<bool, Report<StoreError>> {
        let found: Option<(String,)> = sqlx::query_as("SELECT id FROM conversations WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_failed)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn create(&self, owner: UserId) -> speda_core::Result<ConversationId, StoreError> {
        let id = ConversationId::new();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, owner_id, title, created_at, updated_at)
            VALUES ($1, $2, NULL, $3, $3)
            "#,
        )
        .bind(id.to_string())
        .bind(owner.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage_failed)?;
        Ok(id)
    }

    async fn append(
        &self,
        id: ConversationId,
        message: Message,
    ) -> speda_core::Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage_failed)?;

        let locked: Option<(String,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_failed)?;
        if locked.is_none() {
            return Err(StoreError::NotFound { id }.into());
        }

        sqlx::query(
            r#"
            INSERT INTO conversation_messages
                (id, conversation_id, seq, role, content, attachments, tool_call, created_at)
            SELECT $1, $2, COALESCE(MAX(seq), 0) + 1, $3, $4, $5, $6, $7
            FROM conversation_messages
            WHERE conversation_id = $2
            "#,
        )
        .bind(message.id.to_string())
        .bind(id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(Json(&message.attachments))
        .bind(message.tool_call.as_ref().map(Json))
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_failed)?;

        sqlx::query("UPDATE conversations SET updated_at = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(storage_failed)?;

        tx.commit().await.map_err(storage_failed)?;
        Ok(())
    }

    async fn read_history(
        &self,
        id: ConversationId,
    ) -> speda_core::Result<Vec<Message>, StoreError> {
        if !self.exists(id).await? {
            return Err(StoreError::NotFound { id }.into());
        }

        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, role, content, attachments, tool_call, created_at
            FROM conversation_messages
            WHERE conversation_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        rows.into_iter().map(MessageRow::try_into_message).collect()
    }

    async fn set_title(
        &self,
        id: ConversationId,
        title: &str,
    ) -> speda_core::Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE conversations SET title = $2 WHERE id = $1 AND title IS NULL")
                .bind(id.to_string())
                .bind(title)
                .execute(&self.pool)
                .await
                .map_err(storage_failed)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::NotFound { id }.into())
        }
    }

    async fn delete(&self, id: ConversationId) -> speda_core::Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_failed)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { id }.into());
        }
        Ok(())
    }

    async fn get(&self, id: ConversationId) -> speda_core::Result<ConversationSummary, StoreError> {
        let row: Option<SummaryRow> = sqlx::query_as(&format!("{SUMMARY_SELECT} WHERE c.id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_failed)?;

        match row {
            Some(row) => row.try_into_summary(),
            None => Err(StoreError::NotFound { id }.into()),
        }
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
    ) -> speda_core::Result<Vec<ConversationSummary>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows: Vec<SummaryRow> = sqlx::query_as(&format!(
            "{SUMMARY_SELECT} ORDER BY c.created_at DESC, c.id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        rows.into_iter().map(SummaryRow::try_into_summary).collect()
    }
}
