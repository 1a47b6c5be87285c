//! Error types for the LLM gateway.
//!
//! Every variant is fatal to the turn that observed it; the conversation
//! engine never retries a gateway call on its own.

use std::fmt;

/// Errors from LLM backend operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Provider could not be reached.
    ProviderUnavailable { provider: String, reason: String },
    /// Request was rejected or failed mid-flight.
    RequestFailed { reason: String },
    /// The model produced output that could not be interpreted.
    ResponseParseFailed { reason: String },
    /// Timed out waiting for the model.
    Timeout,
    /// Rate limit exceeded.
    RateLimited { retry_after_secs: Option<u64> },
    /// Invalid backend configuration.
    InvalidConfig { reason: String },
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderUnavailable { provider, reason } => {
                write!(f, "LLM provider '{provider}' unavailable: {reason}")
            }
            Self::RequestFailed { reason } => write!(f, "LLM request failed: {reason}"),
            Self::ResponseParseFailed { reason } => {
                write!(f, "malformed LLM response: {reason}")
            }
            Self::Timeout => write!(f, "LLM request timed out"),
            Self::RateLimited { retry_after_secs } => match retry_after_secs {
                Some(secs) => write!(f, "rate limited, retry after {secs}s"),
                None => write!(f, "rate limited"),
            },
            Self::InvalidConfig { reason } => write!(f, "invalid LLM configuration: {reason}"),
        }
    }
}

impl std::error::Error for LlmError {}
