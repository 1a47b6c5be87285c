//! Turn executor.
//!
//! Drives one conversational turn: model call, zero or more rounds of tool
//! execution, and a final answer. The loop is an explicit state machine
//! bounded by `max_tool_rounds`.
//!
//! Persistence during a turn:
//! - the user message is appended before the first model call
//! - each tool message is appended as soon as its call is resolved
//! - the assistant message is appended only when the turn completes
//!
//! A failed or cancelled turn therefore leaves only completed messages
//! behind.

use crate::confirmation::{ActionKey, ConfirmationLedger};
use crate::error::{StoreError, TurnError};
use crate::message::{Attachment, Message, MessageRole, ToolCallRecord, ToolOutcome};
use crate::recall::Recall;
use crate::store::ConversationStore;
use crate::tool::{ToolContext, ToolDescriptor, ToolRegistry};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::StreamExt;
use rootcause::Report;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use speda_ai::{LlmBackend, LlmError, LlmMessage, LlmRequest, StreamEvent, ToolCallRequest};
use speda_core::{ConversationId, TurnId, UserId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Default persona placed at the top of every system prompt.
pub const DEFAULT_PERSONA: &str = "You are SPEDA, a calm and precise personal assistant. \
Answer in the same language as the user. Use the available tools whenever they help, and never \
claim an action happened unless a tool result confirms it. Deleting data or sending messages \
requires the user's explicit confirmation: when a tool result asks for confirmation, describe \
the action and ask the user to confirm.";

/// How model text is released to the client within one model step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextDelivery {
    /// Hold fragments and release them as one chunk when a tool call
    /// starts or the step ends.
    Buffered,
    /// Forward every fragment as it arrives.
    #[default]
    Immediate,
}

/// Limits and behaviour of the turn loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnConfig {
    /// Maximum number of model steps that may request tools.
    pub max_tool_rounds: usize,
    /// Number of prior messages sent to the model.
    pub max_context_messages: usize,
    /// Deadline for connecting to the model and for each streamed fragment.
    pub gateway_timeout: Duration,
    /// Text fragment release policy.
    pub text_delivery: TextDelivery,
    /// Persona at the top of the system prompt.
    pub persona: String,
    /// Timezone used when the client does not report one.
    pub default_timezone: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 10,
            max_context_messages: 20,
            gateway_timeout: Duration::from_secs(60),
            text_delivery: TextDelivery::default(),
            persona: DEFAULT_PERSONA.to_string(),
            default_timezone: "UTC".to_string(),
        }
    }
}

/// Everything a turn needs from the request.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnInput {
    /// The conversation the turn belongs to. Must already exist.
    pub conversation_id: ConversationId,
    /// The caller.
    pub user_id: UserId,
    /// Display name of the caller, if known.
    pub user_name: Option<String>,
    /// The user's message.
    pub message: String,
    /// Normalized image attachments.
    pub attachments: Vec<Attachment>,
    /// Client-reported location.
    pub location: Option<JsonValue>,
    /// Client-reported IANA timezone.
    pub timezone: Option<String>,
    /// Explicit answer to a pending confirmation.
    pub confirm: Option<bool>,
}

impl TurnInput {
    /// Creates an input with just a message.
    #[must_use]
    pub fn new(conversation_id: ConversationId, user_id: UserId, message: impl Into<String>) -> Self {
        Self {
            conversation_id,
            user_id,
            user_name: None,
            message: message.into(),
            attachments: Vec::new(),
            location: None,
            timezone: None,
            confirm: None,
        }
    }

}

/// Progress reported while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Answer text.
    TextChunk(String),
    /// A tool call is about to be resolved.
    ToolCallRequested { name: String },
    /// A tool call was resolved.
    ToolResolved { name: String, result: JsonValue },
}

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The conversation the turn ran on.
    pub conversation_id: ConversationId,
    /// The user's message.
    pub user_message: String,
    /// The full answer, equal to the concatenation of all text chunks.
    pub content: String,
    /// Every tool call resolved during the turn, in order.
    pub tool_calls: Vec<ToolCallRecord>,
    /// True if the conversation had no messages before this turn.
    pub first_exchange: bool,
}

#[derive(Debug)]
enum TurnState {
    AwaitingModel,
    ToolRequested {
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    Complete,
}

struct ModelStep {
    text: String,
    calls: Vec<ToolCallRequest>,
}

/// Runs turns against a backend, a tool registry and a store.
pub struct TurnExecutor {
    backend: Arc<dyn LlmBackend>,
    registry: Arc<ToolRegistry>,
    store: Arc<dyn ConversationStore>,
    ledger: Arc<ConfirmationLedger>,
    recall: Option<Recall>,
    config: TurnConfig,
}

impl std::fmt::Debug for TurnExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnExecutor")
            .field("model", &self.backend.model())
            .field("tools", &self.registry.len())
            .field("recall", &self.recall.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn store_failure(report: Report<StoreError>) -> TurnError {
    tracing::error!(error = %report, "conversation store failed during turn");
    TurnError::Store {
        reason: report.current_context().to_string(),
    }
}

impl TurnExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        registry: Arc<ToolRegistry>,
        store: Arc<dyn ConversationStore>,
        ledger: Arc<ConfirmationLedger>,
        config: TurnConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            store,
            ledger,
            recall: None,
            config,
        }
    }

    /// Adds remembered facts and recent conversations to every system
    /// prompt.
    #[must_use]
    pub fn with_recall(mut self, recall: Recall) -> Self {
        self.recall = Some(recall);
        self
    }

    /// Returns the long-term memory, if configured.
    #[must_use]
    pub fn recall(&self) -> Option<&Recall> {
        self.recall.as_ref()
    }

    /// Returns the backend, for side tasks that need the model.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Returns the confirmation ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<ConfirmationLedger> {
        &self.ledger
    }

    /// Runs one turn, reporting progress on `events`.
    ///
    /// # Errors
    ///
    /// Returns a `TurnError` for every fatal condition; tool failures are
    /// not fatal and are handed back to the model instead.
    pub async fn run(
        &self,
        input: TurnInput,
        events: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let span = tracing::info_span!(
            "turn",
            turn_id = %TurnId::new(),
            conversation_id = %input.conversation_id,
        );
        self.run_inner(input, events, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        input: TurnInput,
        events: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let conversation_id = input.conversation_id;

        let approved = self
            .ledger
            .begin_turn(conversation_id, &input.message, input.confirm);
        if approved > 0 {
            tracing::info!(approved, "pending actions confirmed by user");
        }

        let history = self
            .store
            .read_history(conversation_id)
            .await
            .map_err(store_failure)?;
        let first_exchange = history.is_empty();

        let recalled = match &self.recall {
            Some(recall) => recall.sections(input.user_id, conversation_id).await,
            None => Vec::new(),
        };
        let mut messages = self.build_messages(&history, &input, &recalled, Utc::now());

        let user_message =
            Message::user(input.message.clone()).with_attachments(input.attachments.clone());
        self.store
            .append(conversation_id, user_message)
            .await
            .map_err(store_failure)?;

        let context = self.tool_context(&input);
        let tools = self.registry.to_llm_format();
        let mut resolved: HashMap<String, ToolCallRecord> = HashMap::new();
        let mut records = Vec::new();
        let mut content = String::new();
        let mut rounds = 0usize;
        let mut state = TurnState::AwaitingModel;

        loop {
            state = match state {
                TurnState::AwaitingModel => {
                    if cancel.is_cancelled() {
                        return Err(TurnError::Aborted);
                    }
                    let request = LlmRequest::new(messages.clone()).with_tools(tools.clone());
                    let step = self.model_step(&request, &events, &cancel).await?;
                    content.push_str(&step.text);

                    if step.calls.is_empty() {
                        if content.trim().is_empty() {
                            return Err(LlmError::ResponseParseFailed {
                                reason: "model returned neither text nor tool calls".to_string(),
                            }
                            .into());
                        }
                        TurnState::Complete
                    } else {
                        rounds += 1;
                        if rounds > self.config.max_tool_rounds {
                            tracing::warn!(
                                limit = self.config.max_tool_rounds,
                                "tool iteration limit exceeded"
                            );
                            return Err(TurnError::IterationCapExceeded {
                                limit: self.config.max_tool_rounds,
                            });
                        }
                        TurnState::ToolRequested {
                            text: step.text,
                            calls: step.calls,
                        }
                    }
                }
                TurnState::ToolRequested { text, calls } => {
                    messages.push(LlmMessage::assistant_tool_calls(text, calls.clone()));

                    for call in calls {
                        if cancel.is_cancelled() {
                            return Err(TurnError::Aborted);
                        }

                        if let Some(earlier) = resolved.get(&call.id) {
                            tracing::debug!(call_id = %call.id, "repeated tool call answered from earlier result");
                            messages.push(LlmMessage::tool_result(
                                call.id.clone(),
                                earlier.result_payload().to_string(),
                            ));
                            continue;
                        }

                        let descriptor = self.registry.lookup(&call.name).map_err(|_| {
                            tracing::warn!(tool = %call.name, "model requested unknown tool");
                            TurnError::ToolNotFound {
                                name: call.name.clone(),
                            }
                        })?;

                        emit(
                            &events,
                            TurnEvent::ToolCallRequested {
                                name: call.name.clone(),
                            },
                        )
                        .await;

                        let outcome = self
                            .resolve_call(descriptor, &call, &context)
                            .await;
                        let record = ToolCallRecord {
                            call_id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                            outcome,
                        };
                        let payload = record.result_payload();

                        self.store
                            .append(conversation_id, Message::tool(record.clone()))
                            .await
                            .map_err(store_failure)?;

                        emit(
                            &events,
                            TurnEvent::ToolResolved {
                                name: record.name.clone(),
                                result: payload.clone(),
                            },
                        )
                        .await;

                        messages.push(LlmMessage::tool_result(call.id.clone(), payload.to_string()));
                        resolved.insert(call.id, record.clone());
                        records.push(record);
                    }
                    TurnState::AwaitingModel
                }
                TurnState::Complete => break,
            };
        }

        self.store
            .append(conversation_id, Message::assistant(content.clone()))
            .await
            .map_err(store_failure)?;

        tracing::info!(
            tool_calls = records.len(),
            rounds,
            "turn complete"
        );

        Ok(TurnOutcome {
            conversation_id,
            user_message: input.message,
            content,
            tool_calls: records,
            first_exchange,
        })
    }

    async fn resolve_call(
        &self,
        descriptor: &ToolDescriptor,
        call: &ToolCallRequest,
        context: &ToolContext,
    ) -> ToolOutcome {
        if descriptor.requires_confirmation() {
            let action = ActionKey::new(&call.name, &call.arguments);
            if !self.ledger.take_approval(context.conversation_id, &action) {
                tracing::info!(tool = %call.name, "tool call held for confirmation");
                self.ledger.record_pending(context.conversation_id, action);
                return ToolOutcome::NeedsConfirmation {
                    message: format!(
                        "'{}' was not run. Describe this action to the user and ask them to confirm it.",
                        call.name
                    ),
                };
            }
        }

        match descriptor.execute(call.arguments.clone(), context).await {
            Ok(result) => {
                tracing::debug!(tool = %call.name, "tool call succeeded");
                ToolOutcome::Success { result }
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tool call failed");
                ToolOutcome::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    /// Runs one streaming model call and collects its text and tool calls.
    async fn model_step(
        &self,
        request: &LlmRequest,
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<ModelStep, TurnError> {
        let deadline = self.config.gateway_timeout;
        let mut stream = bounded(deadline, cancel, self.backend.stream(request)).await??;

        let mut step = ModelStep {
            text: String::new(),
            calls: Vec::new(),
        };
        let mut held = String::new();

        while let Some(event) = bounded(deadline, cancel, stream.next()).await? {
            match event? {
                StreamEvent::TextDelta(fragment) if fragment.is_empty() => {}
                StreamEvent::TextDelta(fragment) => {
                    step.text.push_str(&fragment);
                    match self.config.text_delivery {
                        TextDelivery::Immediate => {
                            emit(events, TurnEvent::TextChunk(fragment)).await;
                        }
                        TextDelivery::Buffered => held.push_str(&fragment),
                    }
                }
                StreamEvent::ToolCall(call) => {
                    flush(events, &mut held).await;
                    step.calls.push(call);
                }
            }
        }
        flush(events, &mut held).await;

        Ok(step)
    }

    fn tool_context(&self, input: &TurnInput) -> ToolContext {
        let (timezone, _) = self.local_zone(input);
        ToolContext {
            user_id: input.user_id,
            user_name: input.user_name.clone(),
            conversation_id: input.conversation_id,
            location: input.location.clone(),
            timezone: Some(timezone),
        }
    }

    /// Resolves the turn's timezone: the client's, else the configured
    /// default, else UTC.
    fn local_zone(&self, input: &TurnInput) -> (String, Tz) {
        let candidates = input
            .timezone
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.config.default_timezone.as_str()));
        for name in candidates {
            match name.parse::<Tz>() {
                Ok(tz) => return (name.to_string(), tz),
                Err(_) => tracing::debug!(timezone = %name, "unknown timezone ignored"),
            }
        }
        ("UTC".to_string(), Tz::UTC)
    }

    fn build_messages(
        &self,
        history: &[Message],
        input: &TurnInput,
        recalled: &[String],
        now: DateTime<Utc>,
    ) -> Vec<LlmMessage> {
        let start = history
            .len()
            .saturating_sub(self.config.max_context_messages);

        let mut messages = vec![LlmMessage::system(self.system_prompt(input, recalled, now))];
        for message in &history[start..] {
            match (message.role, &message.tool_call) {
                (MessageRole::User, _) => messages.push(LlmMessage::user(message.content.clone())),
                (MessageRole::Assistant, _) => {
                    messages.push(LlmMessage::assistant(message.content.clone()));
                }
                (MessageRole::Tool, Some(record)) => {
                    messages.push(LlmMessage::assistant_tool_calls(
                        "",
                        vec![ToolCallRequest::new(
                            record.call_id.clone(),
                            record.name.clone(),
                            record.arguments.clone(),
                        )],
                    ));
                    messages.push(LlmMessage::tool_result(
                        record.call_id.clone(),
                        message.content.clone(),
                    ));
                }
                (MessageRole::Tool, None) => {
                    tracing::warn!(message_id = %message.id, "tool message without call record skipped");
                }
            }
        }

        let images = input
            .attachments
            .iter()
            .map(|a| a.reference.clone())
            .collect();
        messages.push(LlmMessage::user(input.message.clone()).with_images(images));
        messages
    }

    fn system_prompt(&self, input: &TurnInput, recalled: &[String], now: DateTime<Utc>) -> String {
        let (tz_name, tz) = self.local_zone(input);
        let local = now.with_timezone(&tz).naive_local();

        let mut prompt = format!(
            "{}\n\n## Current context\n- Date: {} ({})\n- Time: {}\n- Timezone: {}",
            self.config.persona,
            local.format("%Y-%m-%d"),
            local.format("%A"),
            local.format("%H:%M"),
            tz_name,
        );
        if let Some(name) = &input.user_name {
            prompt.push_str(&format!("\n- User: {name}"));
        }
        if let Some(location) = &input.location {
            prompt.push_str(&format!("\n- User location: {location}"));
        }
        for section in recalled {
            prompt.push_str("\n\n");
            prompt.push_str(section);
        }
        prompt
    }
}

/// Awaits `future` unless the deadline passes or the turn is cancelled.
async fn bounded<F: Future>(
    deadline: Duration,
    cancel: &CancellationToken,
    future: F,
) -> Result<F::Output, TurnError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TurnError::Aborted),
        result = tokio::time::timeout(deadline, future) => {
            result.map_err(|_| TurnError::Gateway(LlmError::Timeout))
        }
    }
}

async fn flush(events: &mpsc::Sender<TurnEvent>, held: &mut String) {
    if !held.is_empty() {
        emit(events, TurnEvent::TextChunk(std::mem::take(held))).await;
    }
}

async fn emit(events: &mpsc::Sender<TurnEvent>, event: TurnEvent) {
    // A closed channel means the listener left; the cancellation token
    // stops the turn at its next safe point.
    if events.send(event).await.is_err() {
        tracing::debug!("turn event dropped, listener gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConversationStore;
    use crate::testing::{Harness, recorded_chunks};
    use serde_json::json;
    use speda_ai::{ScriptedBackend, ScriptedStep};

    fn drain(rx: &mut mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn plain_answer_persists_user_and_assistant() {
        let harness = Harness::new([ScriptedStep::text("Hello there")]).await;
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = harness
            .executor
            .run(harness.input("hi"), tx, CancellationToken::new())
            .await
            .expect("turn");

        assert_eq!(outcome.content, "Hello there");
        assert!(outcome.first_exchange);
        assert_eq!(recorded_chunks(&drain(&mut rx)), "Hello there");

        let history = harness.history().await;
        let roles: Vec<_> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, [MessageRole::User, MessageRole::Assistant]);
    }

    #[tokio::test]
    async fn buffered_text_is_flushed_before_tool_start() {
        let harness = Harness::with_config(
            [
                ScriptedStep::text_then_tools(
                    "Let me check. ",
                    vec![ToolCallRequest::new("c1", "get_tasks", json!({}))],
                ),
                ScriptedStep::text("Nothing due."),
            ],
            TurnConfig {
                text_delivery: TextDelivery::Buffered,
                ..TurnConfig::default()
            },
        )
        .await;
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = harness
            .executor
            .run(harness.input("what's due?"), tx, CancellationToken::new())
            .await
            .expect("turn");

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            TurnEvent::TextChunk("Let me check. ".to_string())
        );
        assert_eq!(
            events[1],
            TurnEvent::ToolCallRequested {
                name: "get_tasks".to_string()
            }
        );
        assert_eq!(recorded_chunks(&events), outcome.content);
        assert_eq!(outcome.content, "Let me check. Nothing due.");
    }

    #[tokio::test]
    async fn fragments_are_forwarded_as_they_arrive_by_default() {
        let harness = Harness::new([ScriptedStep::text("one two three")]).await;
        let (tx, mut rx) = mpsc::channel(64);

        harness
            .executor
            .run(harness.input("count"), tx, CancellationToken::new())
            .await
            .expect("turn");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(recorded_chunks(&events), "one two three");
    }

    #[tokio::test]
    async fn tool_messages_precede_final_answer_in_call_order() {
        let harness = Harness::new([
            ScriptedStep::text_then_tools(
                "",
                vec![
                    ToolCallRequest::new("c1", "create_task", json!({"title": "milk"})),
                    ToolCallRequest::new("c2", "create_task", json!({"title": "eggs"})),
                ],
            ),
            ScriptedStep::tool_call("c3", "get_tasks", json!({})),
            ScriptedStep::text("Added both."),
        ])
        .await;
        let (tx, _rx) = mpsc::channel(64);

        let outcome = harness
            .executor
            .run(harness.input("add milk and eggs"), tx, CancellationToken::new())
            .await
            .expect("turn");

        assert_eq!(outcome.tool_calls.len(), 3);
        let history = harness.history().await;
        let ids: Vec<_> = history
            .iter()
            .filter_map(|m| m.tool_call.as_ref().map(|c| c.call_id.as_str()))
            .collect();
        assert_eq!(ids, ["c1", "c2", "c3"]);
        assert_eq!(history.len(), 5);
        assert_eq!(history[4].role, MessageRole::Assistant);
        assert_eq!(harness.creates(), 2);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_to_the_model() {
        let harness = Harness::new([
            ScriptedStep::tool_call("c1", "create_task", json!({"title": "milk"})),
            ScriptedStep::text("Done."),
        ])
        .await;
        let (tx, _rx) = mpsc::channel(64);

        harness
            .executor
            .run(harness.input("add milk"), tx, CancellationToken::new())
            .await
            .expect("turn");

        let requests = harness.backend.requests();
        assert_eq!(requests.len(), 2);
        let second = &requests[1].messages;
        let assistant = &second[second.len() - 2];
        assert_eq!(assistant.tool_calls[0].id, "c1");
        let tool = &second[second.len() - 1];
        assert_eq!(tool.tool_call_id.as_deref(), Some("c1"));
        assert!(tool.content.contains("milk"));
        assert!(!requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn repeated_call_id_is_not_executed_twice() {
        let harness = Harness::new([
            ScriptedStep::tool_call("c1", "create_task", json!({"title": "milk"})),
            ScriptedStep::tool_call("c1", "create_task", json!({"title": "milk"})),
            ScriptedStep::text("Added."),
        ])
        .await;
        let (tx, _rx) = mpsc::channel(64);

        let outcome = harness
            .executor
            .run(harness.input("add milk"), tx, CancellationToken::new())
            .await
            .expect("turn");

        assert_eq!(harness.creates(), 1);
        assert_eq!(outcome.tool_calls.len(), 1);
        let last = harness.backend.requests().pop().expect("request");
        let answered = last
            .messages
            .iter()
            .filter(|m| m.tool_call_id.as_deref() == Some("c1"))
            .count();
        assert_eq!(answered, 2);
    }

    #[tokio::test]
    async fn unknown_tool_is_fatal() {
        let harness = Harness::new([ScriptedStep::tool_call("c1", "launch_rocket", json!({}))]).await;
        let (tx, _rx) = mpsc::channel(64);

        let err = harness
            .executor
            .run(harness.input("launch"), tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TurnError::ToolNotFound {
                name: "launch_rocket".into()
            }
        );
        let roles: Vec<_> = harness.history().await.iter().map(|m| m.role).collect();
        assert_eq!(roles, [MessageRole::User]);
    }

    #[tokio::test]
    async fn iteration_cap_is_fatal_before_running_tools() {
        let steps: Vec<_> = (0..3)
            .map(|i| ScriptedStep::tool_call(&format!("c{i}"), "create_task", json!({"title": "x"})))
            .collect();
        let harness = Harness::with_config(
            steps,
            TurnConfig {
                max_tool_rounds: 2,
                ..TurnConfig::default()
            },
        )
        .await;
        let (tx, _rx) = mpsc::channel(64);

        let err = harness
            .executor
            .run(harness.input("loop"), tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, TurnError::IterationCapExceeded { limit: 2 });
        assert_eq!(harness.creates(), 2);
        let history = harness.history().await;
        assert!(history.iter().all(|m| m.role != MessageRole::Assistant));
    }

    #[tokio::test]
    async fn invalid_arguments_are_reported_to_the_model() {
        let harness = Harness::new([
            ScriptedStep::tool_call("c1", "create_task", json!({"name": 5})),
            ScriptedStep::text("Sorry, I could not add that."),
        ])
        .await;
        let (tx, _rx) = mpsc::channel(64);

        let outcome = harness
            .executor
            .run(harness.input("add"), tx, CancellationToken::new())
            .await
            .expect("turn");

        assert!(matches!(outcome.tool_calls[0].outcome, ToolOutcome::Error { .. }));
        assert_eq!(harness.creates(), 0);
    }

    #[tokio::test]
    async fn empty_answer_is_malformed() {
        let harness = Harness::new([ScriptedStep::Events(Vec::new())]).await;
        let (tx, _rx) = mpsc::channel(64);

        let err = harness
            .executor
            .run(harness.input("hi"), tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TurnError::Gateway(LlmError::ResponseParseFailed { .. })
        ));
    }

    #[tokio::test]
    async fn gateway_failures_are_fatal() {
        let harness = Harness::new([ScriptedStep::ConnectFailure(LlmError::ProviderUnavailable {
            provider: "ollama".into(),
            reason: "connection refused".into(),
        })])
        .await;
        let (tx, _rx) = mpsc::channel(64);

        let err = harness
            .executor
            .run(harness.input("hi"), tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TurnError::Gateway(LlmError::ProviderUnavailable { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out() {
        let harness = Harness::with_config(
            [ScriptedStep::Stall(vec![StreamEvent::TextDelta("thinking".into())])],
            TurnConfig {
                gateway_timeout: Duration::from_secs(5),
                ..TurnConfig::default()
            },
        )
        .await;
        let (tx, _rx) = mpsc::channel(64);

        let err = harness
            .executor
            .run(harness.input("hi"), tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err, TurnError::Gateway(LlmError::Timeout));
        let roles: Vec<_> = harness.history().await.iter().map(|m| m.role).collect();
        assert_eq!(roles, [MessageRole::User]);
    }

    #[tokio::test]
    async fn cancelled_turn_persists_no_answer() {
        let harness = Harness::new([ScriptedStep::Stall(Vec::new())]).await;
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let executor = Arc::clone(&harness.executor);
        let input = harness.input("hi");
        let token = cancel.clone();
        let handle = tokio::spawn(async move { executor.run(input, tx, token).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = handle.await.expect("join").unwrap_err();

        assert_eq!(err, TurnError::Aborted);
        let roles: Vec<_> = harness.history().await.iter().map(|m| m.role).collect();
        assert_eq!(roles, [MessageRole::User]);
    }

    #[tokio::test]
    async fn cancel_during_tool_keeps_its_result() {
        let harness = Harness::new([
            ScriptedStep::tool_call("c1", "import_contacts", json!({"source": "phone"})),
            ScriptedStep::text("Imported three contacts."),
        ])
        .await;
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let executor = Arc::clone(&harness.executor);
        let input = harness.input("import my contacts");
        let token = cancel.clone();
        let handle = tokio::spawn(async move { executor.run(input, tx, token).await });

        harness.import_started.notified().await;
        cancel.cancel();
        let err = handle.await.expect("join").unwrap_err();

        assert_eq!(err, TurnError::Aborted);
        let history = harness.history().await;
        let roles: Vec<_> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, [MessageRole::User, MessageRole::Tool]);
        let record = history[1].tool_call.as_ref().expect("tool call");
        assert_eq!(record.name, "import_contacts");
        assert!(record.outcome.is_success());
        assert_eq!(harness.backend.remaining_steps(), 1);
    }

    #[tokio::test]
    async fn recalled_sections_reach_the_system_prompt() {
        use crate::recall::{Fact, FactStore, InMemoryFactStore, Recall};

        let harness = Harness::new([ScriptedStep::text("Good morning!")]).await;
        let facts = Arc::new(InMemoryFactStore::new());
        facts
            .upsert(harness.user_id, Fact::new("routines", "wake time", "06:30", 8))
            .await
            .expect("upsert");
        let earlier = harness.store.create(harness.user_id).await.expect("create");
        harness
            .store
            .append(earlier, Message::user("book a dentist appointment"))
            .await
            .expect("append");

        let executor = TurnExecutor::new(
            harness.backend.clone(),
            Arc::new(ToolRegistry::default()),
            harness.store.clone(),
            Arc::new(ConfirmationLedger::new()),
            TurnConfig::default(),
        )
        .with_recall(Recall::new(facts, harness.store.clone()));
        let (tx, _rx) = mpsc::channel(64);

        executor
            .run(harness.input("morning"), tx, CancellationToken::new())
            .await
            .expect("turn");

        let system = &harness.backend.requests()[0].messages[0].content;
        assert!(system.contains("## User Memory"));
        assert!(system.contains("- wake time: 06:30"));
        assert!(system.contains("## Recent Conversations\n- Untitled: book a dentist appointment"));
    }

    #[test]
    fn tools_see_the_configured_timezone_when_the_client_sends_none() {
        let executor = TurnExecutor::new(
            Arc::new(ScriptedBackend::default()),
            Arc::new(ToolRegistry::default()),
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(ConfirmationLedger::new()),
            TurnConfig {
                default_timezone: "Asia/Tokyo".into(),
                ..TurnConfig::default()
            },
        );
        let mut input = TurnInput::new(ConversationId::new(), UserId::new(), "hi");

        assert_eq!(
            executor.tool_context(&input).timezone.as_deref(),
            Some("Asia/Tokyo")
        );

        input.timezone = Some("Europe/Istanbul".into());
        assert_eq!(
            executor.tool_context(&input).timezone.as_deref(),
            Some("Europe/Istanbul")
        );

        input.timezone = Some("Mars/Olympus".into());
        assert_eq!(
            executor.tool_context(&input).timezone.as_deref(),
            Some("Asia/Tokyo")
        );
    }

    #[tokio::test]
    async fn history_window_and_tool_replay() {
        let harness = Harness::with_config(
            [ScriptedStep::text("ok")],
            TurnConfig {
                max_context_messages: 2,
                ..TurnConfig::default()
            },
        )
        .await;
        let store = &harness.store;
        let id = harness.conversation_id;
        store.append(id, Message::user("old question")).await.expect("append");
        store
            .append(
                id,
                Message::tool(ToolCallRecord {
                    call_id: "c0".into(),
                    name: "get_tasks".into(),
                    arguments: json!({}),
                    outcome: ToolOutcome::Success {
                        result: json!({"tasks": []}),
                    },
                }),
            )
            .await
            .expect("append");
        store.append(id, Message::assistant("You have no tasks.")).await.expect("append");
        let (tx, _rx) = mpsc::channel(64);

        let outcome = harness
            .executor
            .run(harness.input("thanks"), tx, CancellationToken::new())
            .await
            .expect("turn");
        assert!(!outcome.first_exchange);

        let sent = &harness.backend.requests()[0].messages;
        let roles: Vec<_> = sent.iter().map(|m| m.role).collect();
        use speda_ai::LlmRole;
        assert_eq!(
            roles,
            [
                LlmRole::System,
                LlmRole::Assistant,
                LlmRole::Tool,
                LlmRole::Assistant,
                LlmRole::User
            ]
        );
        assert_eq!(sent[1].tool_calls[0].id, "c0");
    }

    #[tokio::test]
    async fn images_go_with_the_new_message() {
        let harness = Harness::new([ScriptedStep::text("A cat.")]).await;
        let mut input = harness.input("what is this?");
        input.attachments = vec![Attachment {
            reference: "data:image/png;base64,AAAA".into(),
            mime_type: "image/png".into(),
        }];
        let (tx, _rx) = mpsc::channel(64);

        harness
            .executor
            .run(input, tx, CancellationToken::new())
            .await
            .expect("turn");

        let sent = &harness.backend.requests()[0].messages;
        assert_eq!(sent.last().map(|m| m.images.len()), Some(1));
        assert_eq!(harness.history().await[0].attachments.len(), 1);
    }

    #[test]
    fn system_prompt_uses_client_timezone_and_location() {
        let executor = TurnExecutor::new(
            Arc::new(ScriptedBackend::default()),
            Arc::new(ToolRegistry::default()),
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(ConfirmationLedger::new()),
            TurnConfig::default(),
        );
        let mut input = TurnInput::new(ConversationId::new(), UserId::new(), "hi");
        input.timezone = Some("Europe/Istanbul".into());
        input.location = Some(json!({"city": "Ankara"}));
        let now = DateTime::parse_from_rfc3339("2026-03-02T21:30:00Z")
            .expect("date")
            .with_timezone(&Utc);

        let prompt = executor.system_prompt(&input, &[], now);

        assert!(prompt.starts_with(DEFAULT_PERSONA));
        assert!(prompt.contains("2026-03-03 (Tuesday)"));
        assert!(prompt.contains("00:30"));
        assert!(prompt.contains("Europe/Istanbul"));
        assert!(prompt.contains("Ankara"));
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let executor = TurnExecutor::new(
            Arc::new(ScriptedBackend::default()),
            Arc::new(ToolRegistry::default()),
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(ConfirmationLedger::new()),
            TurnConfig::default(),
        );
        let mut input = TurnInput::new(ConversationId::new(), UserId::new(), "hi");
        input.timezone = Some("Mars/Olympus".into());
        let now = DateTime::parse_from_rfc3339("2026-03-02T21:30:00Z")
            .expect("date")
            .with_timezone(&Utc);

        let prompt = executor.system_prompt(&input, &[], now);
        assert!(prompt.contains("21:30"));
        assert!(prompt.contains("Timezone: UTC"));
    }
}
