//! LLM gateway for speda.
//!
//! The conversation engine talks to language models exclusively through the
//! [`LlmBackend`] trait: a streaming completion that yields text fragments and
//! structured tool-call requests, plus a single-shot completion used for side
//! tasks such as conversation titles.
//!
//! - [`OpenAiCompatibleBackend`]: HTTP client for OpenAI-style chat completion
//!   APIs (OpenAI, Ollama, vLLM, ...)
//! - [`ScriptedBackend`]: deterministic backend that replays scripted steps

pub mod backend;
pub mod error;
pub mod openai;
pub mod scripted;
pub mod sse;

pub use backend::{
    CompletionStream, LlmBackend, LlmBackendConfig, LlmMessage, LlmProvider, LlmRequest,
    LlmResponse, LlmRole, StreamEvent, TokenUsage, ToolCallRequest, ToolSpec,
};
pub use error::LlmError;
pub use openai::OpenAiCompatibleBackend;
pub use scripted::{ScriptedBackend, ScriptedStep};
