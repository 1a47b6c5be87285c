//! Deterministic backend that replays scripted steps.
//!
//! Each call to [`LlmBackend::stream`] consumes the next [`ScriptedStep`];
//! each call to [`LlmBackend::generate`] consumes the next queued
//! generation. Every request is recorded for later inspection.

use crate::backend::{
    CompletionStream, LlmBackend, LlmProvider, LlmRequest, LlmResponse, StreamEvent,
    ToolCallRequest,
};
use crate::error::LlmError;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One scripted model step.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Yield these items, then end the stream.
    Events(Vec<Result<StreamEvent, LlmError>>),
    /// Fail before any event is produced.
    ConnectFailure(LlmError),
    /// Yield these items, then never produce another one.
    Stall(Vec<StreamEvent>),
}

impl ScriptedStep {
    /// A text-only answer, streamed one word at a time.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Events(split_words(text).into_iter().map(Ok).collect())
    }

    /// A single tool call with no accompanying text.
    #[must_use]
    pub fn tool_call(id: &str, name: &str, arguments: JsonValue) -> Self {
        Self::Events(vec![Ok(StreamEvent::ToolCall(ToolCallRequest::new(
            id, name, arguments,
        )))])
    }

    /// Some text followed by tool calls.
    #[must_use]
    pub fn text_then_tools(text: &str, calls: Vec<ToolCallRequest>) -> Self {
        let mut events: Vec<_> = split_words(text).into_iter().map(Ok).collect();
        events.extend(calls.into_iter().map(|c| Ok(StreamEvent::ToolCall(c))));
        Self::Events(events)
    }
}

fn split_words(text: &str) -> Vec<StreamEvent> {
    text.split_inclusive(' ')
        .map(|word| StreamEvent::TextDelta(word.to_string()))
        .collect()
}

/// Backend that replays a script instead of calling a model.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<ScriptedStep>>,
    generations: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedBackend {
    /// Creates a backend with the given streaming steps.
    #[must_use]
    pub fn new(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Queues a result for the next `generate` call.
    #[must_use]
    pub fn with_generation(self, result: Result<LlmResponse, LlmError>) -> Self {
        lock(&self.generations).push_back(result);
        self
    }

    /// Queues a plain text answer for the next `generate` call.
    #[must_use]
    pub fn with_generated_text(self, text: &str) -> Self {
        self.with_generation(Ok(LlmResponse {
            content: text.to_string(),
            model: "scripted".to_string(),
            ..LlmResponse::default()
        }))
    }

    /// Appends another streaming step.
    pub fn push_step(&self, step: ScriptedStep) {
        lock(&self.steps).push_back(step);
    }

    /// Returns every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<LlmRequest> {
        lock(&self.requests).clone()
    }

    /// Returns the number of unconsumed streaming steps.
    #[must_use]
    pub fn remaining_steps(&self) -> usize {
        lock(&self.steps).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panic while holding the lock cannot leave the queues inconsistent.
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn stream(&self, request: &LlmRequest) -> Result<CompletionStream, LlmError> {
        lock(&self.requests).push(request.clone());

        let step = lock(&self.steps)
            .pop_front()
            .ok_or_else(|| LlmError::RequestFailed {
                reason: "script exhausted".to_string(),
            })?;

        match step {
            ScriptedStep::Events(events) => Ok(futures::stream::iter(events).boxed()),
            ScriptedStep::ConnectFailure(err) => Err(err),
            ScriptedStep::Stall(events) => Ok(futures::stream::iter(events.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
        }
    }

    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        lock(&self.requests).push(request.clone());

        lock(&self.generations)
            .pop_front()
            .unwrap_or_else(|| {
                Err(LlmError::RequestFailed {
                    reason: "script exhausted".to_string(),
                })
            })
    }

    fn provider(&self) -> LlmProvider {
        LlmProvider::Scripted
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LlmMessage;
    use serde_json::json;
    use std::time::Duration;

    fn request() -> LlmRequest {
        LlmRequest::new(vec![LlmMessage::user("hi")])
    }

    #[tokio::test]
    async fn replays_steps_in_order_and_records_requests() {
        let backend = ScriptedBackend::new([
            ScriptedStep::tool_call("call_1", "get_tasks", json!({})),
            ScriptedStep::text("All done here"),
        ]);

        let first = LlmResponse::collect(backend.stream(&request()).await.expect("first"), "s")
            .await
            .expect("collect");
        assert_eq!(first.tool_calls.len(), 1);

        let second = LlmResponse::collect(backend.stream(&request()).await.expect("second"), "s")
            .await
            .expect("collect");
        assert_eq!(second.content, "All done here");

        assert_eq!(backend.requests().len(), 2);
        assert_eq!(backend.remaining_steps(), 0);
    }

    #[tokio::test]
    async fn text_is_split_into_several_fragments() {
        let backend = ScriptedBackend::new([ScriptedStep::text("one two three")]);
        let fragments: Vec<_> = backend.stream(&request()).await.expect("stream").collect().await;
        assert_eq!(fragments.len(), 3);
    }

    #[tokio::test]
    async fn exhausted_script_fails() {
        let backend = ScriptedBackend::default();
        assert!(backend.stream(&request()).await.is_err());
        assert!(backend.generate(&request()).await.is_err());
    }

    #[tokio::test]
    async fn stall_never_finishes() {
        let backend = ScriptedBackend::new([ScriptedStep::Stall(vec![StreamEvent::TextDelta(
            "thinking".into(),
        )])]);
        let mut stream = backend.stream(&request()).await.expect("stream");

        assert!(stream.next().await.is_some());
        let next = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn generate_returns_queued_text() {
        let backend = ScriptedBackend::default().with_generated_text("Grocery List");
        let response = backend.generate(&request()).await.expect("generate");
        assert_eq!(response.content, "Grocery List");
    }
}
