//! Streaming session controller.
//!
//! Wraps one turn executor run per request and turns its progress into an
//! ordered stream of [`WireEvent`]s: `start` first, then chunks and tool
//! events as they happen, then exactly one `done` or `error`.
//!
//! At most one turn runs per conversation. The slot is held by a guard
//! owned by the turn's task and released just before the terminal event
//! is sent, so a client may start its next turn as soon as it sees one.

use crate::error::{SessionError, StoreError, TurnError, TurnFailed};
use crate::message::Attachment;
use crate::recall::FactExtractor;
use crate::store::ConversationSummary;
use crate::title::TitleSummarizer;
use crate::turn::{TurnEvent, TurnExecutor, TurnInput, TurnOutcome};
use crate::wire::WireEvent;
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use speda_core::{ConversationId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Maximum accepted message length, in characters.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Controller settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// How long a first turn waits for its title before sending `done`.
    pub title_wait: Duration,
    /// Capacity of the outbound event channel.
    pub channel_capacity: usize,
    /// Facts are extracted each time a conversation grows past a multiple
    /// of this many messages. Zero disables extraction.
    pub extract_every: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            title_wait: Duration::from_secs(5),
            channel_capacity: 64,
            extract_every: 10,
        }
    }
}

/// A turn as submitted by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    /// Conversation to continue; a new one is created when absent.
    pub conversation_id: Option<ConversationId>,
    /// The caller.
    pub user_id: UserId,
    /// Display name of the caller, if known.
    pub user_name: Option<String>,
    /// The user's message.
    pub message: String,
    /// Images as base64, `data:` URLs or external references.
    pub images: Vec<String>,
    /// Client-reported location.
    pub location: Option<JsonValue>,
    /// Client-reported IANA timezone.
    pub timezone: Option<String>,
    /// Explicit answer to a pending confirmation.
    pub confirm: Option<bool>,
}

impl TurnRequest {
    /// Creates a request that starts a new conversation.
    #[must_use]
    pub fn new(user_id: UserId, message: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            user_id,
            user_name: None,
            message: message.into(),
            images: Vec::new(),
            location: None,
            timezone: None,
            confirm: None,
        }
    }

    /// Continues an existing conversation.
    #[must_use]
    pub fn in_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }
}

/// Registry of running turns, one per conversation.
#[derive(Debug, Default)]
pub struct ActiveTurns {
    turns: Mutex<HashMap<ConversationId, CancellationToken>>,
}

impl ActiveTurns {
    fn turns(&self) -> MutexGuard<'_, HashMap<ConversationId, CancellationToken>> {
        self.turns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(self: &Arc<Self>, id: ConversationId) -> Option<ActiveTurnGuard> {
        let mut turns = self.turns();
        if turns.contains_key(&id) {
            return None;
        }
        let token = CancellationToken::new();
        turns.insert(id, token.clone());
        Some(ActiveTurnGuard {
            turns: Arc::clone(self),
            id,
            token,
        })
    }

    /// Cancels the running turn on `id`. Returns false if none is running.
    pub fn cancel(&self, id: ConversationId) -> bool {
        match self.turns().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Returns true if a turn is running on `id`.
    #[must_use]
    pub fn is_active(&self, id: ConversationId) -> bool {
        self.turns().contains_key(&id)
    }
}

/// Holds a conversation's turn slot until dropped.
#[derive(Debug)]
struct ActiveTurnGuard {
    turns: Arc<ActiveTurns>,
    id: ConversationId,
    token: CancellationToken,
}

impl Drop for ActiveTurnGuard {
    fn drop(&mut self) {
        self.turns.turns().remove(&self.id);
    }
}

/// An opened turn: its conversation and its event stream.
#[derive(Debug)]
pub struct OpenTurn {
    /// The conversation the turn runs on.
    pub conversation_id: ConversationId,
    /// Wire events, ending with `done` or `error`.
    pub events: ReceiverStream<WireEvent>,
}

/// Result of draining a turn's stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectedTurn {
    /// The final answer.
    pub reply: String,
    /// The conversation the turn ran on.
    pub conversation_id: ConversationId,
    /// Title generated during the turn, if any.
    pub title: Option<String>,
    /// `{name, result}` for each resolved tool call, in order.
    pub tool_results: Vec<JsonValue>,
}

/// Opens turns and streams their events.
pub struct SessionController {
    executor: Arc<TurnExecutor>,
    titles: TitleSummarizer,
    extractor: Option<FactExtractor>,
    active: Arc<ActiveTurns>,
    config: SessionConfig,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("executor", &self.executor)
            .field("extractor", &self.extractor)
            .field("active", &self.active)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Creates a controller around an executor.
    #[must_use]
    pub fn new(executor: Arc<TurnExecutor>, config: SessionConfig) -> Self {
        let titles = TitleSummarizer::new(
            Arc::clone(executor.backend()),
            Arc::clone(executor.store()),
        );
        let extractor = executor.recall().map(|recall| {
            FactExtractor::new(
                Arc::clone(executor.backend()),
                Arc::clone(executor.store()),
                Arc::clone(recall.facts()),
            )
        });
        Self {
            executor,
            titles,
            extractor,
            active: Arc::new(ActiveTurns::default()),
            config,
        }
    }

    /// Returns the running-turn registry.
    #[must_use]
    pub fn active_turns(&self) -> &Arc<ActiveTurns> {
        &self.active
    }

    /// Cancels the running turn on `id`. Returns false if none is running.
    pub fn stop(&self, id: ConversationId) -> bool {
        let stopped = self.active.cancel(id);
        if stopped {
            tracing::info!(conversation_id = %id, "turn stop requested");
        }
        stopped
    }

    /// Deletes a conversation, stopping any running turn and dropping its
    /// pending confirmations.
    ///
    /// # Errors
    ///
    /// Returns the store's error, `NotFound` included.
    pub async fn delete_conversation(&self, id: ConversationId) -> speda_core::Result<(), StoreError> {
        self.active.cancel(id);
        self.executor.ledger().forget(id);
        self.executor.store().delete(id).await
    }

    /// Validates the request, resolves its conversation and starts the turn.
    ///
    /// # Errors
    ///
    /// Fails before any event is produced if the input is invalid, the
    /// conversation does not exist, or a turn is already running on it.
    #[tracing::instrument(skip_all, fields(conversation_id = ?request.conversation_id))]
    pub async fn open(&self, request: TurnRequest) -> Result<OpenTurn, SessionError> {
        let char_count = request.message.chars().count();
        if request.message.trim().is_empty() {
            return Err(SessionError::InvalidInput {
                reason: "message must not be empty".to_string(),
            });
        }
        if char_count > MAX_MESSAGE_CHARS {
            return Err(SessionError::InvalidInput {
                reason: format!("message exceeds {MAX_MESSAGE_CHARS} characters"),
            });
        }

        let attachments = request
            .images
            .iter()
            .map(String::as_str)
            .map(Attachment::from_submitted)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SessionError::InvalidInput {
                reason: e.to_string(),
            })?;

        let store = self.executor.store();
        let conversation_id = match request.conversation_id {
            Some(id) => {
                store.get(id).await.map_err(|report| match report.current_context() {
                    StoreError::NotFound { id } => SessionError::NotFound { id: *id },
                    other => {
                        tracing::error!(error = %report, "failed to load conversation");
                        SessionError::Store {
                            reason: other.to_string(),
                        }
                    }
                })?;
                id
            }
            None => {
                let id = store.create(request.user_id).await.map_err(|report| {
                    tracing::error!(error = %report, "failed to create conversation");
                    SessionError::Store {
                        reason: report.current_context().to_string(),
                    }
                })?;
                tracing::info!(conversation_id = %id, "conversation created");
                id
            }
        };

        let guard = self.active.try_acquire(conversation_id).ok_or_else(|| {
            tracing::info!(conversation_id = %conversation_id, "turn rejected, another is running");
            SessionError::TurnInProgress {
                id: conversation_id,
            }
        })?;

        let input = TurnInput {
            conversation_id,
            user_id: request.user_id,
            user_name: request.user_name,
            message: request.message,
            attachments,
            location: request.location,
            timezone: request.timezone,
            confirm: request.confirm,
        };

        let (wire_tx, wire_rx) = mpsc::channel(self.config.channel_capacity);
        let driver = TurnDriver {
            executor: Arc::clone(&self.executor),
            titles: self.titles.clone(),
            extractor: self.extractor.clone(),
            config: self.config.clone(),
            cancel: guard.token.clone(),
            guard: Some(guard),
            wire: wire_tx,
        };
        tokio::spawn(driver.drive(input));

        Ok(OpenTurn {
            conversation_id,
            events: ReceiverStream::new(wire_rx),
        })
    }
}

struct TurnDriver {
    executor: Arc<TurnExecutor>,
    titles: TitleSummarizer,
    extractor: Option<FactExtractor>,
    config: SessionConfig,
    cancel: CancellationToken,
    /// Released before the terminal event goes out.
    guard: Option<ActiveTurnGuard>,
    wire: mpsc::Sender<WireEvent>,
}

impl TurnDriver {
    async fn send(&self, event: WireEvent) -> bool {
        self.wire.send(event).await.is_ok()
    }

    /// Frees the conversation's turn slot and sends the terminal event.
    async fn terminate(&mut self, event: WireEvent) {
        self.guard.take();
        self.send(event).await;
    }

    async fn drive(mut self, input: TurnInput) {
        let conversation_id = input.conversation_id;
        let owner = input.user_id;
        let cancel = self.cancel.clone();

        if !self.send(WireEvent::Start { conversation_id }).await {
            tracing::info!(%conversation_id, "client left before the turn started");
            return;
        }

        let (turn_tx, mut turn_rx) = mpsc::channel(self.config.channel_capacity);
        let executor = Arc::clone(&self.executor);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { executor.run(input, turn_tx, token).await });

        loop {
            tokio::select! {
                event = turn_rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.send(to_wire(event)).await && !cancel.is_cancelled() {
                        tracing::info!(%conversation_id, "client disconnected, cancelling turn");
                        cancel.cancel();
                    }
                }
                () = self.wire.closed(), if !cancel.is_cancelled() => {
                    tracing::info!(%conversation_id, "client disconnected, cancelling turn");
                    cancel.cancel();
                }
            }
        }

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(%conversation_id, error = %e, "turn task failed");
                self.terminate(WireEvent::Error {
                    message: "internal error".to_string(),
                })
                .await;
                return;
            }
        };

        match result {
            Ok(outcome) => self.finish(owner, outcome).await,
            Err(TurnError::Aborted) => {
                tracing::info!(%conversation_id, "turn aborted");
                // Nobody may be listening any more.
                self.terminate(WireEvent::Error {
                    message: TurnError::Aborted.client_message(),
                })
                .await;
            }
            Err(e) => {
                tracing::warn!(%conversation_id, error = %e, "turn failed");
                self.terminate(WireEvent::Error {
                    message: e.client_message(),
                })
                .await;
            }
        }
    }

    async fn finish(&mut self, owner: UserId, outcome: TurnOutcome) {
        let summary = match self.executor.store().get(outcome.conversation_id).await {
            Ok(summary) => Some(summary),
            Err(report) => {
                tracing::warn!(error = %report, "could not reload conversation after turn");
                None
            }
        };

        if let Some(summary) = &summary {
            self.schedule_extraction(owner, summary, &outcome);
            // Any successful turn on an untitled conversation may title it,
            // so a failed first turn does not leave it untitled for good.
            if summary.title.is_none()
                && let Some(title) = self.wait_for_title(&outcome).await
            {
                self.send(WireEvent::TitleGenerated { title }).await;
            }
        }

        self.terminate(WireEvent::Done {
            content: outcome.content,
        })
        .await;
    }

    /// Starts a detached fact extraction when this turn carried the
    /// conversation past a multiple of `extract_every` messages.
    fn schedule_extraction(&self, owner: UserId, summary: &ConversationSummary, outcome: &TurnOutcome) {
        let Some(extractor) = &self.extractor else {
            return;
        };
        let every = self.config.extract_every;
        if every == 0 {
            return;
        }

        let added = outcome.tool_calls.len() + 2;
        let before = summary.message_count.saturating_sub(added);
        if summary.message_count / every > before / every {
            let extractor = extractor.clone();
            let id = summary.id;
            tracing::debug!(conversation_id = %id, messages = summary.message_count, "scheduling fact extraction");
            tokio::spawn(async move { extractor.extract(owner, id).await });
        }
    }

    /// Spawns the title task and waits for it up to `title_wait`. The task
    /// keeps running, and stores its title, if the wait runs out.
    async fn wait_for_title(&self, outcome: &TurnOutcome) -> Option<String> {
        let id = outcome.conversation_id;
        let titles = self.titles.clone();
        let user_message = outcome.user_message.clone();
        let answer = outcome.content.clone();
        let mut task =
            tokio::spawn(async move { titles.summarize(id, &user_message, &answer).await });

        match tokio::time::timeout(self.config.title_wait, &mut task).await {
            Ok(Ok(title)) => title,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "title task failed");
                None
            }
            Err(_) => {
                tracing::debug!("title not ready, sending done without it");
                None
            }
        }
    }
}

fn to_wire(event: TurnEvent) -> WireEvent {
    match event {
        TurnEvent::TextChunk(content) => WireEvent::Chunk { content },
        TurnEvent::ToolCallRequested { name } => WireEvent::FunctionStart { name },
        TurnEvent::ToolResolved { name, result } => WireEvent::FunctionResult { name, result },
    }
}

/// Drains an opened turn into a single response.
///
/// # Errors
///
/// Returns `TurnFailed` if the stream ends with an error event or without
/// a terminal event.
pub async fn collect_turn(turn: OpenTurn) -> Result<CollectedTurn, TurnFailed> {
    let mut collected = CollectedTurn {
        reply: String::new(),
        conversation_id: turn.conversation_id,
        title: None,
        tool_results: Vec::new(),
    };

    let mut events = turn.events;
    while let Some(event) = events.next().await {
        match event {
            WireEvent::Start { conversation_id } => collected.conversation_id = conversation_id,
            WireEvent::Chunk { .. } | WireEvent::FunctionStart { .. } => {}
            WireEvent::FunctionResult { name, result } => {
                collected
                    .tool_results
                    .push(json!({ "name": name, "result": result }));
            }
            WireEvent::TitleGenerated { title } => collected.title = Some(title),
            WireEvent::Done { content } => {
                collected.reply = content;
                return Ok(collected);
            }
            WireEvent::Error { message } => return Err(TurnFailed { message }),
        }
    }

    Err(TurnFailed {
        message: "turn ended unexpectedly".to_string(),
    })
}
