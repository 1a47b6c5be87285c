//! Long-term memory about the user.
//!
//! Facts are small `category/key/value` records rated 1 to 10 for
//! importance. The model extracts them from a conversation every few
//! messages; the important ones are placed in every system prompt along
//! with a short list of the user's recent conversations.

use crate::error::StoreError;
use crate::message::MessageRole;
use crate::store::{ConversationStore, ConversationSummary};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use speda_ai::{LlmBackend, LlmMessage, LlmRequest};
use speda_core::{ConversationId, Result, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Facts below this importance stay out of the system prompt.
pub const MIN_PROMPT_IMPORTANCE: u8 = 5;

/// Number of other conversations listed in the system prompt.
pub const RECENT_CONVERSATIONS: usize = 3;

/// Conversations shorter than this are not worth mining.
const MIN_EXTRACTION_MESSAGES: usize = 5;

/// How many trailing messages the extractor reads.
const EXTRACTION_WINDOW: usize = 20;

/// One remembered fact about the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    /// Grouping such as `preferences` or `routines`, lowercase.
    pub category: String,
    /// What the fact is about. Unique within a category.
    pub key: String,
    /// The remembered value.
    pub value: String,
    /// 1 (trivia) to 10 (essential).
    pub importance: u8,
}

impl Fact {
    /// Creates a fact, normalizing the category and clamping importance.
    #[must_use]
    pub fn new(
        category: impl AsRef<str>,
        key: impl Into<String>,
        value: impl Into<String>,
        importance: u8,
    ) -> Self {
        Self {
            category: category.as_ref().trim().to_lowercase(),
            key: key.into(),
            value: value.into(),
            importance: importance.clamp(1, 10),
        }
    }
}

/// Storage for remembered facts.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Stores a fact, replacing the value and importance of an existing
    /// fact with the same category and key.
    async fn upsert(&self, owner: UserId, fact: Fact) -> Result<(), StoreError>;

    /// Returns the owner's facts rated at least `min_importance`, most
    /// important first.
    async fn important(&self, owner: UserId, min_importance: u8) -> Result<Vec<Fact>, StoreError>;
}

/// Fact store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryFactStore {
    facts: RwLock<HashMap<UserId, Vec<Fact>>>,
}

impl InMemoryFactStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn upsert(&self, owner: UserId, fact: Fact) -> Result<(), StoreError> {
        let mut facts = self.facts.write().await;
        let owned = facts.entry(owner).or_default();
        match owned
            .iter_mut()
            .find(|f| f.category == fact.category && f.key == fact.key)
        {
            Some(existing) => {
                existing.value = fact.value;
                existing.importance = fact.importance;
            }
            None => owned.push(fact),
        }
        Ok(())
    }

    async fn important(&self, owner: UserId, min_importance: u8) -> Result<Vec<Fact>, StoreError> {
        let mut found: Vec<Fact> = self
            .facts
            .read()
            .await
            .get(&owner)
            .map(|facts| {
                facts
                    .iter()
                    .filter(|f| f.importance >= min_importance)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Stable, so equal importance keeps insertion order.
        found.sort_by(|a, b| b.importance.cmp(&a.importance));
        Ok(found)
    }
}

/// Renders facts as a `## User Memory` section, grouped by category in
/// order of first appearance.
#[must_use]
pub fn render_facts(facts: &[Fact]) -> Option<String> {
    if facts.is_empty() {
        return None;
    }

    let mut categories: Vec<(&str, Vec<&Fact>)> = Vec::new();
    for fact in facts {
        match categories
            .iter_mut()
            .find(|(name, _)| *name == fact.category.as_str())
        {
            Some((_, group)) => group.push(fact),
            None => categories.push((fact.category.as_str(), vec![fact])),
        }
    }

    let mut section = String::from("## User Memory");
    for (category, group) in categories {
        section.push_str(&format!("\n\n### {}", capitalize(category)));
        for fact in group {
            section.push_str(&format!("\n- {}: {}", fact.key, fact.value));
        }
    }
    Some(section)
}

/// Renders other conversations as a `## Recent Conversations` section.
#[must_use]
pub fn render_recent(conversations: &[ConversationSummary]) -> Option<String> {
    if conversations.is_empty() {
        return None;
    }

    let mut section = String::from("## Recent Conversations");
    for conversation in conversations {
        let title = conversation.title.as_deref().unwrap_or("Untitled");
        match &conversation.preview {
            Some(preview) => section.push_str(&format!("\n- {title}: {preview}")),
            None => section.push_str(&format!("\n- {title}")),
        }
    }
    Some(section)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Assembles the memory sections of a system prompt.
#[derive(Clone)]
pub struct Recall {
    facts: Arc<dyn FactStore>,
    store: Arc<dyn ConversationStore>,
}

impl Recall {
    /// Creates a recall over a fact store and the conversation store.
    #[must_use]
    pub fn new(facts: Arc<dyn FactStore>, store: Arc<dyn ConversationStore>) -> Self {
        Self { facts, store }
    }

    /// Returns the fact store.
    #[must_use]
    pub fn facts(&self) -> &Arc<dyn FactStore> {
        &self.facts
    }

    /// Returns the prompt sections for `owner`, leaving out the
    /// conversation in progress. Lookup failures drop the affected section.
    pub async fn sections(&self, owner: UserId, current: ConversationId) -> Vec<String> {
        let mut sections = Vec::new();

        match self.facts.important(owner, MIN_PROMPT_IMPORTANCE).await {
            Ok(facts) => sections.extend(render_facts(&facts)),
            Err(report) => tracing::warn!(error = %report, "failed to load remembered facts"),
        }

        // Over-fetch: the current conversation and other users' are skipped.
        match self.store.list(RECENT_CONVERSATIONS * 4 + 1, 0).await {
            Ok(conversations) => {
                let recent: Vec<_> = conversations
                    .into_iter()
                    .filter(|c| c.owner == owner && c.id != current && c.message_count > 0)
                    .take(RECENT_CONVERSATIONS)
                    .collect();
                sections.extend(render_recent(&recent));
            }
            Err(report) => tracing::warn!(error = %report, "failed to list recent conversations"),
        }

        sections
    }
}

impl std::fmt::Debug for Recall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recall").finish_non_exhaustive()
    }
}

/// Mines a conversation for facts worth remembering.
///
/// Best-effort like the title summarizer: failures are logged and yield
/// no facts.
#[derive(Clone)]
pub struct FactExtractor {
    backend: Arc<dyn LlmBackend>,
    store: Arc<dyn ConversationStore>,
    facts: Arc<dyn FactStore>,
}

impl FactExtractor {
    /// Creates an extractor.
    #[must_use]
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        store: Arc<dyn ConversationStore>,
        facts: Arc<dyn FactStore>,
    ) -> Self {
        Self {
            backend,
            store,
            facts,
        }
    }

    /// Extracts facts from the tail of a conversation and stores them.
    ///
    /// Returns the stored facts.
    #[tracing::instrument(skip_all, fields(conversation_id = %id))]
    pub async fn extract(&self, owner: UserId, id: ConversationId) -> Vec<Fact> {
        let history = match self.store.read_history(id).await {
            Ok(history) => history,
            Err(report) => {
                tracing::warn!(error = %report, "failed to read conversation for fact extraction");
                return Vec::new();
            }
        };
        if history.len() < MIN_EXTRACTION_MESSAGES {
            return Vec::new();
        }

        let start = history.len().saturating_sub(EXTRACTION_WINDOW);
        let transcript = history[start..]
            .iter()
            .filter(|m| m.role != MessageRole::Tool)
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let request = LlmRequest::new(vec![
            LlmMessage::system("You extract key facts from conversations for long-term memory."),
            LlmMessage::user(extraction_prompt(&transcript)),
        ])
        .with_temperature(0.2);

        let response = match self.backend.generate(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "fact extraction failed");
                return Vec::new();
            }
        };

        let mut stored = Vec::new();
        for fact in parse_facts(&response.content) {
            match self.facts.upsert(owner, fact.clone()).await {
                Ok(()) => stored.push(fact),
                Err(report) => tracing::warn!(error = %report, "failed to store fact"),
            }
        }
        tracing::info!(facts = stored.len(), "facts extracted");
        stored
    }
}

impl std::fmt::Debug for FactExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactExtractor")
            .field("model", &self.backend.model())
            .finish_non_exhaustive()
    }
}

fn extraction_prompt(transcript: &str) -> String {
    format!(
        "Analyze this conversation and extract any important facts about the user that should \
be remembered long-term.\n\n\
Focus on:\n\
- Preferences (communication style, scheduling preferences)\n\
- Important information (job, relationships, locations)\n\
- Routines (wake time, work schedule)\n\
- Key decisions made\n\n\
Format each fact on its own line as:\n\
CATEGORY|KEY|VALUE|IMPORTANCE(1-10)\n\n\
Only include genuinely important facts. If nothing is worth remembering, respond with \"NONE\".\n\n\
Conversation:\n{transcript}"
    )
}

/// Parses `CATEGORY|KEY|VALUE|IMPORTANCE` lines, skipping anything else.
#[must_use]
pub fn parse_facts(text: &str) -> Vec<Fact> {
    if text.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }

    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().trim_start_matches("- ").split('|').collect();
            let [category, key, value, importance] = parts.as_slice() else {
                return None;
            };
            let importance = importance.trim().parse::<u8>().ok()?;
            let (key, value) = (key.trim(), value.trim());
            if category.trim().is_empty() || key.is_empty() || value.is_empty() {
                return None;
            }
            Some(Fact::new(category, key, value, importance))
        })
        .collect()
}
