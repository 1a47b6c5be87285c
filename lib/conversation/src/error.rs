//! Error types for the conversation crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `StoreError`: Errors from conversation store operations
//! - `ToolError`: Errors from tool lookup and execution
//! - `TurnError`: Terminal failures of one turn
//! - `SessionError`: Errors raised before a turn starts streaming
//! - `TurnFailed`: A streamed turn that ended in an error event

use speda_ai::LlmError;
use speda_core::ConversationId;
use std::fmt;

/// Errors from conversation store operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Conversation not found.
    NotFound { id: ConversationId },
    /// Storage operation failed.
    StorageFailed { reason: String },
    /// Stored data could not be decoded.
    InvalidData { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "conversation not found: {id}"),
            Self::StorageFailed { reason } => {
                write!(f, "conversation storage failed: {reason}")
            }
            Self::InvalidData { reason } => {
                write!(f, "invalid stored conversation data: {reason}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from tool lookup and execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    /// Tool not found.
    NotFound { name: String },
    /// Tool execution failed.
    ExecutionFailed { name: String, reason: String },
    /// Invalid tool input.
    InvalidInput { name: String, reason: String },
}

impl ToolError {
    /// Creates an execution failure for `name`.
    #[must_use]
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { name } => write!(f, "tool not found: {name}"),
            Self::ExecutionFailed { name, reason } => {
                write!(f, "tool '{name}' execution failed: {reason}")
            }
            Self::InvalidInput { name, reason } => {
                write!(f, "invalid input for tool '{name}': {reason}")
            }
        }
    }
}

impl std::error::Error for ToolError {}

/// Terminal failure of a turn.
///
/// Tool execution errors never appear here; they are recorded and handed
/// back to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    /// The model requested a tool that is not registered.
    ToolNotFound { name: String },
    /// The LLM gateway failed (unreachable, timeout, malformed output).
    Gateway(LlmError),
    /// The model kept requesting tools past the configured limit.
    IterationCapExceeded { limit: usize },
    /// The turn was cancelled before it completed.
    Aborted,
    /// Reading or writing the conversation failed.
    Store { reason: String },
}

impl TurnError {
    /// Returns the message reported to the client.
    ///
    /// Store failures and provider responses are reported generically;
    /// the details are logged where they occur.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Store { .. } => "failed to save conversation".to_string(),
            Self::Aborted => "turn cancelled".to_string(),
            Self::Gateway(LlmError::RequestFailed { .. }) => {
                "the language model request failed".to_string()
            }
            Self::Gateway(LlmError::ResponseParseFailed { .. }) => {
                "the language model returned a malformed response".to_string()
            }
            Self::Gateway(LlmError::ProviderUnavailable { provider, .. }) => {
                format!("LLM provider '{provider}' unavailable")
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToolNotFound { name } => write!(f, "model requested unknown tool '{name}'"),
            Self::Gateway(err) => write!(f, "{err}"),
            Self::IterationCapExceeded { limit } => {
                write!(f, "tool iteration limit of {limit} exceeded")
            }
            Self::Aborted => write!(f, "turn aborted"),
            Self::Store { reason } => write!(f, "conversation store failed: {reason}"),
        }
    }
}

impl std::error::Error for TurnError {}

impl From<LlmError> for TurnError {
    fn from(err: LlmError) -> Self {
        Self::Gateway(err)
    }
}

/// Errors raised when opening a turn, before any event is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The requested conversation does not exist.
    NotFound { id: ConversationId },
    /// Another turn is already running on this conversation.
    TurnInProgress { id: ConversationId },
    /// The submitted turn is malformed.
    InvalidInput { reason: String },
    /// The store could not be reached.
    Store { reason: String },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "conversation not found: {id}"),
            Self::TurnInProgress { id } => {
                write!(f, "a turn is already in progress on {id}")
            }
            Self::InvalidInput { reason } => write!(f, "invalid input: {reason}"),
            Self::Store { reason } => write!(f, "conversation store failed: {reason}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// A turn that ended with an error event, as seen by a collecting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnFailed {
    /// The message carried by the error event.
    pub message: String,
}

impl fmt::Display for TurnFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn failed: {}", self.message)
    }
}

impl std::error::Error for TurnFailed {}
