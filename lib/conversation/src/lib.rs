//! Conversation engine for the speda assistant.
//!
//! This crate provides:
//!
//! - **Turn Executor**: one user turn driven through the model/tool loop
//! - **Session Controller**: per-turn event streams, one turn per conversation
//! - **Conversation Store**: durable history behind an async trait
//! - **Tool Registry**: typed tools with generated JSON schemas
//! - **Confirmation Ledger**: approval gating for destructive tools
//! - **Title Summarizer**: best-effort titles for new conversations
//! - **Recall**: remembered facts and recent conversations for the prompt

pub mod confirmation;
pub mod error;
pub mod memory;
pub mod message;
pub mod recall;
pub mod session;
pub mod store;
pub mod title;
pub mod tool;
pub mod turn;
pub mod wire;

#[cfg(test)]
mod testing;

pub use confirmation::{ActionKey, ConfirmationLedger, is_affirmative};
pub use error::{SessionError, StoreError, ToolError, TurnError, TurnFailed};
pub use memory::InMemoryConversationStore;
pub use message::{Attachment, InvalidAttachment, Message, MessageRole, ToolCallRecord, ToolOutcome};
pub use recall::{Fact, FactExtractor, FactStore, InMemoryFactStore, Recall};
pub use session::{
    ActiveTurns, CollectedTurn, MAX_MESSAGE_CHARS, OpenTurn, SessionConfig, SessionController,
    TurnRequest, collect_turn,
};
pub use store::{ConversationStore, ConversationSummary};
pub use title::TitleSummarizer;
pub use tool::{Tool, ToolContext, ToolDefinition, ToolDescriptor, ToolRegistry, ToolRegistryBuilder};
pub use turn::{TextDelivery, TurnConfig, TurnEvent, TurnExecutor, TurnInput, TurnOutcome};
pub use wire::WireEvent;
