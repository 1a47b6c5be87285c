//! OpenAI-compatible chat completion backend.
//!
//! Speaks the `/chat/completions` protocol used by OpenAI, Ollama, vLLM and
//! most hosted gateways. Streaming responses arrive as SSE; text deltas are
//! forwarded as they are decoded, tool-call deltas are accumulated per
//! index and emitted once the model finishes the step.

use crate::backend::{
    CompletionStream, LlmBackend, LlmBackendConfig, LlmMessage, LlmProvider, LlmRequest,
    LlmResponse, LlmRole, StreamEvent, TokenUsage, ToolCallRequest,
};
use crate::error::LlmError;
use crate::sse::SseDecoder;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

const STREAM_BUFFER: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// HTTP backend for OpenAI-style chat completion APIs.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    config: LlmBackendConfig,
    endpoint: String,
}

impl OpenAiCompatibleBackend {
    /// Creates a backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the base URL or model is empty, or if the
    /// HTTP client cannot be built.
    pub fn new(config: LlmBackendConfig) -> Result<Self, LlmError> {
        if config.base_url.trim().is_empty() {
            return Err(LlmError::InvalidConfig {
                reason: "base_url must not be empty".to_string(),
            });
        }
        if config.model.trim().is_empty() {
            return Err(LlmError::InvalidConfig {
                reason: "model must not be empty".to_string(),
            });
        }

        // Streams get no overall timeout; the caller bounds each fragment.
        // Non-streaming calls set their own deadline in `generate`.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::InvalidConfig {
                reason: e.to_string(),
            })?;

        let endpoint = format!(
            "{}/chat/completions",
            config.base_url.trim_end_matches('/')
        );

        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    /// Returns the chat completions URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Renders the JSON request body.
    #[must_use]
    pub fn request_body(&self, request: &LlmRequest, stream: bool) -> JsonValue {
        let messages: Vec<JsonValue> = request.messages.iter().map(render_message).collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": stream,
        });

        if !request.tools.is_empty() {
            let tools: Vec<JsonValue> = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = JsonValue::Array(tools);
        }

        if let Some(temperature) = request.temperature.or(self.config.temperature) {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens.or(self.config.max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }

        body
    }

    fn request_timeout(&self) -> Duration {
        self.config
            .request_timeout_secs
            .map_or(DEFAULT_REQUEST_TIMEOUT, Duration::from_secs)
    }

    async fn send(
        &self,
        body: &JsonValue,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, LlmError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        if let Some(api_key) = self.config.api_key.as_deref()
            && !api_key.is_empty()
        {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            tracing::warn!(
                error = %e,
                endpoint = %self.endpoint,
                "Failed to reach LLM endpoint"
            );
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::ProviderUnavailable {
                    provider: self.config.provider.as_str().to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(LlmError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                endpoint = %self.endpoint,
                status = %status,
                body = %body,
                "LLM endpoint returned error"
            );
            return Err(LlmError::RequestFailed {
                reason: format!("HTTP {status}: {body}"),
            });
        }

        Ok(response)
    }
}

fn render_message(message: &LlmMessage) -> JsonValue {
    match message.role {
        LlmRole::System => json!({ "role": "system", "content": message.content }),
        LlmRole::User if message.images.is_empty() => {
            json!({ "role": "user", "content": message.content })
        }
        LlmRole::User => {
            let mut parts = vec![json!({ "type": "text", "text": message.content })];
            parts.extend(message.images.iter().map(|url| {
                json!({ "type": "image_url", "image_url": { "url": url } })
            }));
            json!({ "role": "user", "content": parts })
        }
        LlmRole::Assistant if message.tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": message.content })
        }
        LlmRole::Assistant => {
            let calls: Vec<JsonValue> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                JsonValue::Null
            } else {
                JsonValue::String(message.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        LlmRole::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Reassembles tool calls that arrive split across stream chunks.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialCall>,
}

impl ToolCallAccumulator {
    fn push(&mut self, delta: ToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id
            && !id.is_empty()
        {
            entry.id = Some(id);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name
                && !name.is_empty()
            {
                entry.name = Some(name);
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Result<Vec<ToolCallRequest>, LlmError> {
        self.calls
            .into_iter()
            .map(|(index, call)| {
                let name = call.name.ok_or_else(|| LlmError::ResponseParseFailed {
                    reason: format!("tool call {index} has no function name"),
                })?;
                let arguments = parse_arguments(&name, &call.arguments)?;
                let id = call.id.unwrap_or_else(|| format!("call_{index}"));
                Ok(ToolCallRequest::new(id, name, arguments))
            })
            .collect()
    }
}

fn parse_arguments(name: &str, raw: &str) -> Result<JsonValue, LlmError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| LlmError::ResponseParseFailed {
        reason: format!("invalid arguments for tool '{name}': {e}"),
    })
}

/// Progress of one streamed response.
#[derive(Debug, Default)]
struct StreamState {
    calls: ToolCallAccumulator,
    /// Set once the provider reports a finish reason or sends `[DONE]`.
    finished: bool,
}

/// Decodes one SSE `data:` payload, returning any text deltas and feeding
/// tool-call fragments into the accumulator.
fn decode_chunk(data: &str, state: &mut StreamState) -> Result<Vec<StreamEvent>, LlmError> {
    let chunk: ChatChunk =
        serde_json::from_str(data).map_err(|e| LlmError::ResponseParseFailed {
            reason: format!("invalid stream chunk: {e}"),
        })?;

    if let Some(error) = chunk.error {
        return Err(LlmError::RequestFailed {
            reason: error
                .get("message")
                .and_then(JsonValue::as_str)
                .map_or_else(|| error.to_string(), str::to_string),
        });
    }

    let mut events = Vec::new();
    for choice in chunk.choices {
        if choice.finish_reason.is_some() {
            state.finished = true;
        }
        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            events.push(StreamEvent::TextDelta(content));
        }
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            state.calls.push(delta);
        }
    }
    Ok(events)
}

async fn pump_stream(response: reqwest::Response, tx: mpsc::Sender<Result<StreamEvent, LlmError>>) {
    let byte_stream = response
        .bytes_stream()
        .map(|result| result.map_err(std::io::Error::other));
    let reader = tokio::io::BufReader::new(StreamReader::new(byte_stream));
    let mut lines = reader.lines();
    let mut decoder = SseDecoder::new();
    let mut state = StreamState::default();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) => None,
            Err(e) => {
                let _ = tx
                    .send(Err(LlmError::RequestFailed {
                        reason: format!("stream interrupted: {e}"),
                    }))
                    .await;
                return;
            }
        };

        let event = match &line {
            Some(line) => decoder.push_line(line),
            None => decoder.finish(),
        };

        if let Some(event) = event {
            if event.is_done() {
                state.finished = true;
                break;
            }
            match decode_chunk(&event.data, &mut state) {
                Ok(events) => {
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            // Receiver gone; the turn was cancelled.
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        if line.is_none() {
            break;
        }
    }

    if !state.finished {
        tracing::warn!("LLM stream closed before the response completed");
        let _ = tx
            .send(Err(LlmError::RequestFailed {
                reason: "stream closed before response completed".to_string(),
            }))
            .await;
        return;
    }

    match state.calls.finish() {
        Ok(calls) => {
            for call in calls {
                if tx.send(Ok(StreamEvent::ToolCall(call))).await.is_err() {
                    return;
                }
            }
        }
        Err(e) => {
            let _ = tx.send(Err(e)).await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<CompletionUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Debug, Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Debug, Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn parse_completion(completion: ChatCompletion, fallback_model: &str) -> Result<LlmResponse, LlmError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::ResponseParseFailed {
            reason: "response has no choices".to_string(),
        })?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let arguments = parse_arguments(&call.function.name, &call.function.arguments)?;
            Ok(ToolCallRequest::new(call.id, call.function.name, arguments))
        })
        .collect::<Result<Vec<_>, LlmError>>()?;

    let usage = completion
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(LlmResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
        model: completion
            .model
            .unwrap_or_else(|| fallback_model.to_string()),
    })
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    #[tracing::instrument(skip_all, fields(model = %self.config.model, messages = request.messages.len()))]
    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError> {
        let body = self.request_body(request, true);
        let response = self.send(&body, None).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(pump_stream(response, tx));

        Ok(ReceiverStream::new(rx).boxed())
    }

    #[tracing::instrument(skip_all, fields(model = %self.config.model, messages = request.messages.len()))]
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let body = self.request_body(request, false);
        let response = self.send(&body, Some(self.request_timeout())).await?;

        let completion: ChatCompletion =
            response
                .json()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        LlmError::Timeout
                    } else {
                        LlmError::ResponseParseFailed {
                            reason: e.to_string(),
                        }
                    }
                })?;

        let response = parse_completion(completion, &self.config.model)?;
        tracing::debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "LLM completion finished"
        );
        Ok(response)
    }

    fn provider(&self) -> LlmProvider {
        self.config.provider
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}
