//! Application state and routing.

use crate::routes::chat;
use axum::Router;
use axum::routing::{get, post};
use speda_conversation::{ConversationStore, SessionController};
use speda_core::UserId;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// The user the assistant serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub user_id: UserId,
    pub name: Option<String>,
}

/// Shared application state.
pub struct AppState {
    /// Opens and stops turns.
    pub sessions: SessionController,
    /// Conversation history.
    pub store: Arc<dyn ConversationStore>,
    /// The assistant's owner.
    pub owner: Owner,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(sessions: SessionController, store: Arc<dyn ConversationStore>, owner: Owner) -> Self {
        Self {
            sessions,
            store,
            owner,
        }
    }
}

/// Builds the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(chat::health))
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/stream", post(chat::chat_stream))
        .route("/api/chat/conversations", get(chat::list_conversations))
        .route(
            "/api/chat/conversations/{id}",
            get(chat::get_conversation).delete(chat::delete_conversation),
        )
        .route("/api/chat/conversations/{id}/stop", post(chat::stop_turn))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
