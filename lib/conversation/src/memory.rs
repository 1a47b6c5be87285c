//! In-memory conversation store.
//!
//! Each conversation lives behind its own async mutex so concurrent turns
//! on different conversations never contend, and appends to one
//! conversation are applied in lock acquisition order (tokio mutexes are
//! FIFO fair).

use crate::error::StoreError;
use crate::message::Message;
use crate::store::{ConversationStore, ConversationSummary, preview_of};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use speda_core::{ConversationId, Result, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
struct StoredConversation {
    /// Creation order within this store.
    seq: u64,
    owner: UserId,
    title: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
}

impl StoredConversation {
    fn summary(&self, id: ConversationId) -> ConversationSummary {
        ConversationSummary {
            id,
            owner: self.owner,
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            preview: self.messages.first().map(|m| preview_of(&m.content)),
        }
    }
}

/// Conversation store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<ConversationId, Arc<Mutex<StoredConversation>>>>,
    next_seq: AtomicU64,
}

impl InMemoryConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(
        &self,
        id: ConversationId,
    ) -> Result<Arc<Mutex<StoredConversation>>, StoreError> {
        self.conversations
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id }.into())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self, owner: UserId) -> Result<ConversationId, StoreError> {
        let id = ConversationId::new();
        let now = Utc::now();
        let conversation = StoredConversation {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            owner,
            title: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        };
        self.conversations
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(conversation)));
        Ok(id)
    }

    async fn append(&self, id: ConversationId, message: Message) -> Result<(), StoreError> {
        let entry = self.entry(id).await?;
        let mut conversation = entry.lock().await;
        conversation.updated_at = Utc::now();
        conversation.messages.push(message);
        Ok(())
    }

    async fn read_history(&self, id: ConversationId) -> Result<Vec<Message>, StoreError> {
        let entry = self.entry(id).await?;
        let conversation = entry.lock().await;
        Ok(conversation.messages.clone())
    }

    async fn set_title(&self, id: ConversationId, title: &str) -> Result<bool, StoreError> {
        let entry = self.entry(id).await?;
        let mut conversation = entry.lock().await;
        if conversation.title.is_some() {
            return Ok(false);
        }
        conversation.title = Some(title.to_string());
        Ok(true)
    }

    async fn delete(&self, id: ConversationId) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound { id }.into())
    }

    async fn get(&self, id: ConversationId) -> Result<ConversationSummary, StoreError> {
        let entry = self.entry(id).await?;
        let conversation = entry.lock().await;
        Ok(conversation.summary(id))
    }

    async fn list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let entries: Vec<(ConversationId, Arc<Mutex<StoredConversation>>)> = self
            .conversations
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let mut summaries = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            let conversation = entry.lock().await;
            summaries.push((conversation.seq, conversation.summary(id)));
        }
        summaries.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(summaries
            .into_iter()
            .map(|(_, summary)| summary)
            .skip(offset)
            .take(limit)
            .collect())
    }
}
