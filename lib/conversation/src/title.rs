//! Conversation title summarizer.
//!
//! Best-effort: any failure leaves the title unset and is only logged.

use crate::store::ConversationStore;
use speda_ai::{LlmBackend, LlmMessage, LlmRequest};
use speda_core::ConversationId;
use std::sync::Arc;

/// Maximum title length, in characters.
pub const MAX_TITLE_CHARS: usize = 50;

/// How much of the first answer is shown to the model.
const ANSWER_EXCERPT_CHARS: usize = 200;

/// Derives a short title from a conversation's first exchange.
#[derive(Clone)]
pub struct TitleSummarizer {
    backend: Arc<dyn LlmBackend>,
    store: Arc<dyn ConversationStore>,
}

impl TitleSummarizer {
    /// Creates a summarizer.
    #[must_use]
    pub fn new(backend: Arc<dyn LlmBackend>, store: Arc<dyn ConversationStore>) -> Self {
        Self { backend, store }
    }

    /// Generates a title and stores it if the conversation has none yet.
    ///
    /// Returns the title when it was applied.
    #[tracing::instrument(skip_all, fields(conversation_id = %id))]
    pub async fn summarize(
        &self,
        id: ConversationId,
        user_message: &str,
        answer: &str,
    ) -> Option<String> {
        let request = LlmRequest::new(vec![LlmMessage::user(title_prompt(user_message, answer))])
            .with_temperature(0.7)
            .with_max_tokens(30);

        let response = match self.backend.generate(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "title generation failed");
                return None;
            }
        };

        let Some(title) = clean_title(&response.content) else {
            tracing::debug!("model returned an empty title");
            return None;
        };

        match self.store.set_title(id, &title).await {
            Ok(true) => {
                tracing::info!(%title, "conversation titled");
                Some(title)
            }
            Ok(false) => None,
            Err(report) => {
                tracing::warn!(error = %report, "failed to store conversation title");
                None
            }
        }
    }
}

fn title_prompt(user_message: &str, answer: &str) -> String {
    let excerpt: String = answer.chars().take(ANSWER_EXCERPT_CHARS).collect();
    format!(
        "Write a short title of 2 to 5 words for a conversation that began with this exchange.\n\n\
User: {user_message}\n\
Assistant: {excerpt}\n\n\
Use the same language as the user. Capture the main topic. \
No quotes, no trailing punctuation. Reply with the title only."
    )
}

/// Trims whitespace and surrounding quotes and caps the length.
/// Returns `None` if nothing is left.
#[must_use]
pub fn clean_title(raw: &str) -> Option<String> {
    let first_line = raw.trim().lines().next().unwrap_or_default();
    let unquoted = first_line
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '«' | '»'))
        .trim();
    let title: String = unquoted.chars().take(MAX_TITLE_CHARS).collect();
    let title = title.trim_end().to_string();
    (!title.is_empty()).then_some(title)
}
