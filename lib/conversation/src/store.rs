//! Conversation storage contract.
//!
//! A conversation is an append-only, strictly ordered message history plus
//! metadata. `append` is the only way messages change; appends for one
//! conversation are applied in the order they are submitted.

use crate::error::StoreError;
use crate::message::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use speda_core::{ConversationId, Result, UserId};

/// Maximum number of characters of the first message shown in listings.
pub const PREVIEW_CHARS: usize = 100;

/// Listing view of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Conversation identifier.
    pub id: ConversationId,
    /// The user who owns the conversation.
    pub owner: UserId,
    /// Title, once derived.
    pub title: Option<String>,
    /// When the conversation was created.
    pub created_at: DateTime<Utc>,
    /// When a message was last appended.
    pub updated_at: DateTime<Utc>,
    /// Number of stored messages.
    pub message_count: usize,
    /// Start of the first message.
    pub preview: Option<String>,
}

/// Returns the listing preview for a first message.
#[must_use]
pub fn preview_of(content: &str) -> String {
    content.chars().take(PREVIEW_CHARS).collect()
}

/// Storage for conversations and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates an empty conversation and returns its identifier.
    async fn create(&self, owner: UserId) -> Result<ConversationId, StoreError>;

    /// Appends a message to the end of the conversation.
    async fn append(&self, id: ConversationId, message: Message) -> Result<(), StoreError>;

    /// Returns all messages in creation order.
    async fn read_history(&self, id: ConversationId) -> Result<Vec<Message>, StoreError>;

    /// Sets the title if none is set. Returns whether the title was applied.
    async fn set_title(&self, id: ConversationId, title: &str) -> Result<bool, StoreError>;

    /// Deletes the conversation and all its messages.
    async fn delete(&self, id: ConversationId) -> Result<(), StoreError>;

    /// Returns the summary of one conversation.
    async fn get(&self, id: ConversationId) -> Result<ConversationSummary, StoreError>;

    /// Lists conversations, most recently created first.
    async fn list(&self, limit: usize, offset: usize)
    -> Result<Vec<ConversationSummary>, StoreError>;
}
