//! LLM backend abstraction.
//!
//! Provides a unified interface for chat-completion providers with
//! function calling.

use crate::error::LlmError;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Available LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Local Ollama instance (OpenAI-compatible endpoint).
    Ollama,
    /// OpenAI API.
    OpenAi,
    /// Any other OpenAI-compatible API.
    OpenAiCompatible,
    /// In-process scripted backend.
    Scripted,
}

impl LlmProvider {
    /// Returns the provider name used in logs and errors.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai_compatible",
            Self::Scripted => "scripted",
        }
    }
}

/// Configuration for an HTTP LLM backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmBackendConfig {
    /// The provider type.
    pub provider: LlmProvider,
    /// Base URL for the API, up to and including the version segment.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// API key (if required).
    pub api_key: Option<String>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
    /// Maximum tokens to generate per call.
    pub max_tokens: Option<u32>,
    /// Overall deadline for non-streaming calls, in seconds.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl LlmBackendConfig {
    /// Creates a configuration for a local Ollama instance.
    #[must_use]
    pub fn ollama(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: LlmProvider::Ollama,
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            request_timeout_secs: None,
        }
    }

    /// Creates a configuration for the OpenAI API.
    #[must_use]
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            model: model.into(),
            api_key: Some(api_key.into()),
            temperature: None,
            max_tokens: None,
            request_timeout_secs: None,
        }
    }
}

/// The role of a message sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Model output.
    Assistant,
    /// Result of a tool call.
    Tool,
}

/// A structured tool-call request produced by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Call identifier assigned by the model.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Arguments as produced by the model.
    pub arguments: JsonValue,
}

impl ToolCallRequest {
    /// Creates a new tool-call request.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A message in the model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    /// The role of the sender.
    pub role: LlmRole,
    /// Text content.
    pub content: String,
    /// Image URLs (usually `data:` URLs) attached to a user message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// The call a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl LlmMessage {
    fn new(role: LlmRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(LlmRole::System, content)
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(LlmRole::User, content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(LlmRole::Assistant, content)
    }

    /// Creates an assistant message that requests tool calls.
    #[must_use]
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        let mut msg = Self::new(LlmRole::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    /// Creates a tool result message answering `tool_call_id`.
    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(LlmRole::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Attaches image URLs.
    #[must_use]
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name.
    pub name: String,
    /// What the tool does, for the model.
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: JsonValue,
}

/// A request to an LLM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Conversation so far, system prompt first.
    pub messages: Vec<LlmMessage>,
    /// Tools the model may call.
    pub tools: Vec<ToolSpec>,
    /// Temperature override.
    pub temperature: Option<f32>,
    /// Max tokens override.
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Creates a request from messages.
    #[must_use]
    pub fn new(messages: Vec<LlmMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    /// Advertises tools.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the max tokens.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// One event of a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental text.
    TextDelta(String),
    /// A complete tool-call request.
    ToolCall(ToolCallRequest),
}

/// A streaming completion. Ends when the model has finished its response.
pub type CompletionStream = BoxStream<'static, Result<StreamEvent, LlmError>>;

/// A complete (non-streaming) response from an LLM.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmResponse {
    /// The generated text.
    pub content: String,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Token usage statistics.
    pub usage: TokenUsage,
    /// Model that generated the response.
    pub model: String,
}

impl LlmResponse {
    /// Collects a streaming completion into a single response.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by the stream.
    pub async fn collect(
        mut stream: CompletionStream,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let mut response = Self {
            model: model.into(),
            ..Self::default()
        };
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(text) => response.content.push_str(&text),
                StreamEvent::ToolCall(call) => response.tool_calls.push(call),
            }
        }
        Ok(response)
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Number of input tokens.
    pub input_tokens: u32,
    /// Number of output tokens.
    pub output_tokens: u32,
}

impl TokenUsage {
    /// Returns the total number of tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Trait for LLM backends.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Starts a streaming completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be started. Errors after
    /// that point are yielded by the stream itself.
    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError>;

    /// Generates a complete response.
    ///
    /// # Errors
    ///
    /// Returns an error if the LLM call fails.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Returns the provider type.
    fn provider(&self) -> LlmProvider;

    /// Returns the model name.
    fn model(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let request = LlmRequest::new(vec![
            LlmMessage::system("You are a helpful assistant."),
            LlmMessage::user("Hello"),
        ])
        .with_temperature(0.7)
        .with_max_tokens(100);

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, LlmRole::System);
        assert_eq!(request.temperature, Some(0.7));
        assert_eq!(request.max_tokens, Some(100));
    }

    #[test]
    fn tool_result_message_references_call() {
        let msg = LlmMessage::tool_result("call_1", "{\"ok\":true}");
        assert_eq!(msg.role, LlmRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
    }

    #[tokio::test]
    async fn collect_concatenates_text_and_keeps_calls() {
        let events = vec![
            Ok(StreamEvent::TextDelta("Let me ".to_string())),
            Ok(StreamEvent::TextDelta("check.".to_string())),
            Ok(StreamEvent::ToolCall(ToolCallRequest::new(
                "call_1",
                "get_tasks",
                serde_json::json!({}),
            ))),
        ];
        let stream: CompletionStream = futures::stream::iter(events).boxed();

        let response = LlmResponse::collect(stream, "test-model")
            .await
            .expect("collect");

        assert_eq!(response.content, "Let me check.");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.model, "test-model");
    }

    #[tokio::test]
    async fn collect_stops_at_first_error() {
        let events = vec![
            Ok(StreamEvent::TextDelta("partial".to_string())),
            Err(LlmError::Timeout),
        ];
        let stream: CompletionStream = futures::stream::iter(events).boxed();

        let err = LlmResponse::collect(stream, "m").await.unwrap_err();
        assert_eq!(err, LlmError::Timeout);
    }
}
