//! Shared fixtures for the engine's tests.

use crate::confirmation::ConfirmationLedger;
use crate::error::ToolError;
use crate::memory::InMemoryConversationStore;
use crate::message::Message;
use crate::store::ConversationStore;
use crate::tool::{Tool, ToolContext, ToolRegistry};
use crate::turn::{TurnConfig, TurnEvent, TurnExecutor, TurnInput};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use speda_ai::{ScriptedBackend, ScriptedStep};
use speda_core::{ConversationId, UserId};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Deserialize, JsonSchema)]
pub(crate) struct CreateTaskArgs {
    title: String,
}

pub(crate) struct CreateTask {
    calls: Arc<AtomicUsize>,
}

impl Tool for CreateTask {
    type Args = CreateTaskArgs;
    const NAME: &'static str = "create_task";

    fn description(&self) -> &str {
        "Create a task"
    }

    async fn execute(&self, args: CreateTaskArgs, _context: &ToolContext) -> Result<JsonValue, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "id": format!("t{n}"), "title": args.title }))
    }
}

#[derive(Deserialize, JsonSchema)]
pub(crate) struct NoArgs {}

pub(crate) struct GetTasks;

impl Tool for GetTasks {
    type Args = NoArgs;
    const NAME: &'static str = "get_tasks";

    fn description(&self) -> &str {
        "List tasks"
    }

    async fn execute(&self, _args: NoArgs, _context: &ToolContext) -> Result<JsonValue, ToolError> {
        Ok(json!({ "tasks": [] }))
    }
}

#[derive(Deserialize, JsonSchema)]
pub(crate) struct DeleteTaskArgs {
    task_id: String,
}

pub(crate) struct DeleteTask {
    calls: Arc<AtomicUsize>,
}

impl Tool for DeleteTask {
    type Args = DeleteTaskArgs;
    const NAME: &'static str = "delete_task";

    fn description(&self) -> &str {
        "Delete a task"
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, args: DeleteTaskArgs, _context: &ToolContext) -> Result<JsonValue, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "deleted": args.task_id }))
    }
}

#[derive(Deserialize, JsonSchema)]
pub(crate) struct CalendarArgs {
    #[allow(dead_code)]
    start_date: String,
}

pub(crate) struct BrokenCalendar;

impl Tool for BrokenCalendar {
    type Args = CalendarArgs;
    const NAME: &'static str = "get_calendar_events";

    fn description(&self) -> &str {
        "List calendar events"
    }

    async fn execute(&self, _args: CalendarArgs, _context: &ToolContext) -> Result<JsonValue, ToolError> {
        Err(ToolError::failed(Self::NAME, "calendar unavailable"))
    }
}

#[derive(Deserialize, JsonSchema)]
pub(crate) struct ImportArgs {
    source: String,
}

/// Takes a while, so a turn can be cancelled while it runs.
pub(crate) struct SlowImport {
    started: Arc<Notify>,
}

impl Tool for SlowImport {
    type Args = ImportArgs;
    const NAME: &'static str = "import_contacts";

    fn description(&self) -> &str {
        "Import contacts"
    }

    async fn execute(&self, args: ImportArgs, _context: &ToolContext) -> Result<JsonValue, ToolError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({ "imported": 3, "source": args.source }))
    }
}

/// An executor wired to a scripted backend, an in-memory store and the
/// fixture tools, plus one empty conversation.
pub(crate) struct Harness {
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<InMemoryConversationStore>,
    pub executor: Arc<TurnExecutor>,
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    /// Notified when `import_contacts` starts running.
    pub import_started: Arc<Notify>,
    creates: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
}

impl Harness {
    pub async fn new(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self::with_config(steps, TurnConfig::default()).await
    }

    pub async fn with_config(
        steps: impl IntoIterator<Item = ScriptedStep>,
        config: TurnConfig,
    ) -> Self {
        Self::with_backend(Arc::new(ScriptedBackend::new(steps)), config).await
    }

    pub async fn with_backend(backend: Arc<ScriptedBackend>, config: TurnConfig) -> Self {
        let creates = Arc::new(AtomicUsize::new(0));
        let deletes = Arc::new(AtomicUsize::new(0));
        let import_started = Arc::new(Notify::new());
        let registry = ToolRegistry::builder()
            .register(CreateTask {
                calls: Arc::clone(&creates),
            })
            .register(GetTasks)
            .register(DeleteTask {
                calls: Arc::clone(&deletes),
            })
            .register(BrokenCalendar)
            .register(SlowImport {
                started: Arc::clone(&import_started),
            })
            .build();

        let store = Arc::new(InMemoryConversationStore::new());
        let user_id = UserId::new();
        let conversation_id = store.create(user_id).await.expect("create conversation");

        let executor = Arc::new(TurnExecutor::new(
            backend.clone(),
            Arc::new(registry),
            store.clone(),
            Arc::new(ConfirmationLedger::new()),
            config,
        ));

        Self {
            backend,
            store,
            executor,
            conversation_id,
            user_id,
            import_started,
            creates,
            deletes,
        }
    }

    pub fn input(&self, message: &str) -> TurnInput {
        TurnInput::new(self.conversation_id, self.user_id, message)
    }

    pub async fn history(&self) -> Vec<Message> {
        self.store
            .read_history(self.conversation_id)
            .await
            .expect("history")
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

/// Concatenates the text chunks among `events`.
pub(crate) fn recorded_chunks(events: &[TurnEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            TurnEvent::TextChunk(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
