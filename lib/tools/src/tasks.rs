//! Task list tools.
//!
//! Tasks are kept per user in memory. Deleting a task requires the user's
//! confirmation; the other operations run directly.

use chrono::{DateTime, NaiveDate, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use speda_conversation::{Tool, ToolContext, ToolError};
use speda_core::{TaskId, UserId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Default number of tasks returned by `get_tasks`.
const DEFAULT_MAX_RESULTS: usize = 20;

/// A task in a user's list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub notes: Option<String>,
    pub due: Option<NaiveDate>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// In-memory task lists, one per user.
#[derive(Debug, Default)]
pub struct TaskList {
    tasks: RwLock<HashMap<UserId, Vec<Task>>>,
}

impl TaskList {
    /// Creates an empty task list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task for `owner`.
    pub fn add(
        &self,
        owner: UserId,
        title: String,
        notes: Option<String>,
        due: Option<NaiveDate>,
    ) -> Task {
        let task = Task {
            id: TaskId::new(),
            title,
            notes,
            due,
            completed: false,
            created_at: Utc::now(),
        };
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(owner)
            .or_default()
            .push(task.clone());
        task
    }

    /// Returns `owner`'s tasks in creation order.
    #[must_use]
    pub fn list(&self, owner: UserId, include_completed: bool, limit: usize) -> Vec<Task> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&owner)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter(|t| include_completed || !t.completed)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Marks a task completed. Returns `None` if `owner` has no such task.
    pub fn complete(&self, owner: UserId, id: TaskId) -> Option<Task> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let task = tasks.get_mut(&owner)?.iter_mut().find(|t| t.id == id)?;
        task.completed = true;
        Some(task.clone())
    }

    /// Removes a task. Returns `None` if `owner` has no such task.
    pub fn remove(&self, owner: UserId, id: TaskId) -> Option<Task> {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let list = tasks.get_mut(&owner)?;
        let index = list.iter().position(|t| t.id == id)?;
        Some(list.remove(index))
    }
}

fn parse_task_id(tool: &str, raw: &str) -> Result<TaskId, ToolError> {
    raw.parse().map_err(|e: speda_core::ParseIdError| ToolError::InvalidInput {
        name: tool.to_string(),
        reason: e.to_string(),
    })
}

fn task_not_found(tool: &str, id: TaskId) -> ToolError {
    ToolError::failed(tool, format!("task not found: {id}"))
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateTaskArgs {
    /// The title of the task
    title: String,
    /// Optional notes for the task
    #[serde(default)]
    notes: Option<String>,
    /// Optional due date (YYYY-MM-DD)
    #[serde(default)]
    due_date: Option<String>,
}

/// `create_task`: adds a task.
pub struct CreateTask {
    tasks: Arc<TaskList>,
}

impl CreateTask {
    #[must_use]
    pub fn new(tasks: Arc<TaskList>) -> Self {
        Self { tasks }
    }
}

impl Tool for CreateTask {
    type Args = CreateTaskArgs;
    const NAME: &'static str = "create_task";

    fn description(&self) -> &str {
        "Create a new task. Use this when the user wants to add a task, reminder, or to-do item."
    }

    async fn execute(&self, args: CreateTaskArgs, context: &ToolContext) -> Result<JsonValue, ToolError> {
        let title = args.title.trim();
        if title.is_empty() {
            return Err(ToolError::InvalidInput {
                name: Self::NAME.to_string(),
                reason: "title must not be empty".to_string(),
            });
        }
        let due = args
            .due_date
            .as_deref()
            .map(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
            .transpose()
            .map_err(|e| ToolError::InvalidInput {
                name: Self::NAME.to_string(),
                reason: format!("due_date: {e}"),
            })?;

        let task = self
            .tasks
            .add(context.user_id, title.to_string(), args.notes, due);
        tracing::info!(task_id = %task.id, "task created");
        Ok(json!({
            "task_id": task.id.to_string(),
            "title": task.title,
            "message": format!("Created task: {}", task.title),
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetTasksArgs {
    /// Whether to include completed tasks
    #[serde(default)]
    show_completed: bool,
    /// Maximum number of tasks to return
    #[serde(default)]
    max_results: Option<usize>,
}

/// `get_tasks`: lists the user's tasks.
pub struct GetTasks {
    tasks: Arc<TaskList>,
}

impl GetTasks {
    #[must_use]
    pub fn new(tasks: Arc<TaskList>) -> Self {
        Self { tasks }
    }
}

impl Tool for GetTasks {
    type Args = GetTasksArgs;
    const NAME: &'static str = "get_tasks";

    fn description(&self) -> &str {
        "Get the user's tasks. Use this when the user asks about their tasks, to-do list, or things to do."
    }

    async fn execute(&self, args: GetTasksArgs, context: &ToolContext) -> Result<JsonValue, ToolError> {
        let limit = args.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        let tasks: Vec<JsonValue> = self
            .tasks
            .list(context.user_id, args.show_completed, limit)
            .into_iter()
            .map(|t| {
                json!({
                    "id": t.id.to_string(),
                    "title": t.title,
                    "notes": t.notes,
                    "due": t.due,
                    "status": if t.completed { "completed" } else { "open" },
                })
            })
            .collect();
        Ok(json!({ "count": tasks.len(), "tasks": tasks }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TaskIdArgs {
    /// The ID of the task
    task_id: String,
}

/// `complete_task`: marks a task done.
pub struct CompleteTask {
    tasks: Arc<TaskList>,
}

impl CompleteTask {
    #[must_use]
    pub fn new(tasks: Arc<TaskList>) -> Self {
        Self { tasks }
    }
}

impl Tool for CompleteTask {
    type Args = TaskIdArgs;
    const NAME: &'static str = "complete_task";

    fn description(&self) -> &str {
        "Mark a task as completed. Use this when the user says they finished a task."
    }

    async fn execute(&self, args: TaskIdArgs, context: &ToolContext) -> Result<JsonValue, ToolError> {
        let id = parse_task_id(Self::NAME, &args.task_id)?;
        let task = self
            .tasks
            .complete(context.user_id, id)
            .ok_or_else(|| task_not_found(Self::NAME, id))?;
        Ok(json!({
            "task_id": task.id.to_string(),
            "message": format!("Completed task: {}", task.title),
        }))
    }
}

/// `delete_task`: removes a task. Needs confirmation.
pub struct DeleteTask {
    tasks: Arc<TaskList>,
}

impl DeleteTask {
    #[must_use]
    pub fn new(tasks: Arc<TaskList>) -> Self {
        Self { tasks }
    }
}

impl Tool for DeleteTask {
    type Args = TaskIdArgs;
    const NAME: &'static str = "delete_task";

    fn description(&self) -> &str {
        "Delete a task. Use this when the user wants to remove a task."
    }

    fn requires_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, args: TaskIdArgs, context: &ToolContext) -> Result<JsonValue, ToolError> {
        let id = parse_task_id(Self::NAME, &args.task_id)?;
        let task = self
            .tasks
            .remove(context.user_id, id)
            .ok_or_else(|| task_not_found(Self::NAME, id))?;
        tracing::info!(task_id = %task.id, "task deleted");
        Ok(json!({
            "task_id": task.id.to_string(),
            "message": format!("Deleted task: {}", task.title),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speda_core::ConversationId;

    fn context(user_id: UserId) -> ToolContext {
        ToolContext {
            user_id,
            user_name: None,
            conversation_id: ConversationId::new(),
            location: None,
            timezone: None,
        }
    }

    fn args<T: serde::de::DeserializeOwned>(value: JsonValue) -> T {
        serde_json::from_value(value).expect("args")
    }

    #[tokio::test]
    async fn create_list_complete_delete() {
        let tasks = Arc::new(TaskList::new());
        let ctx = context(UserId::new());

        let created = CreateTask::new(tasks.clone())
            .execute(args(json!({"title": "milk", "due_date": "2026-10-20"})), &ctx)
            .await
            .expect("create");
        assert_eq!(created["message"], "Created task: milk");
        let task_id = created["task_id"].as_str().expect("id").to_string();

        let listed = GetTasks::new(tasks.clone())
            .execute(args(json!({})), &ctx)
            .await
            .expect("list");
        assert_eq!(listed["count"], 1);
        assert_eq!(listed["tasks"][0]["due"], "2026-10-20");

        CompleteTask::new(tasks.clone())
            .execute(args(json!({"task_id": task_id})), &ctx)
            .await
            .expect("complete");
        let open = GetTasks::new(tasks.clone())
            .execute(args(json!({})), &ctx)
            .await
            .expect("list");
        assert_eq!(open["count"], 0);
        let all = GetTasks::new(tasks.clone())
            .execute(args(json!({"show_completed": true})), &ctx)
            .await
            .expect("list");
        assert_eq!(all["tasks"][0]["status"], "completed");

        DeleteTask::new(tasks.clone())
            .execute(args(json!({"task_id": task_id})), &ctx)
            .await
            .expect("delete");
        assert!(tasks.list(ctx.user_id, true, 10).is_empty());
    }

    #[tokio::test]
    async fn tasks_are_scoped_to_their_owner() {
        let tasks = Arc::new(TaskList::new());
        let owner = context(UserId::new());
        let stranger = context(UserId::new());

        let created = CreateTask::new(tasks.clone())
            .execute(args(json!({"title": "private"})), &owner)
            .await
            .expect("create");

        let err = DeleteTask::new(tasks.clone())
            .execute(args(json!({"task_id": created["task_id"]})), &stranger)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
        assert_eq!(tasks.list(owner.user_id, false, 10).len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected() {
        let tasks = Arc::new(TaskList::new());
        let ctx = context(UserId::new());
        let create = CreateTask::new(tasks.clone());

        let bad_date = create
            .execute(args(json!({"title": "milk", "due_date": "next week"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(bad_date, ToolError::InvalidInput { .. }));

        let blank = create.execute(args(json!({"title": "  "})), &ctx).await.unwrap_err();
        assert!(matches!(blank, ToolError::InvalidInput { .. }));

        let bad_id = CompleteTask::new(tasks)
            .execute(args(json!({"task_id": "nope"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(bad_id, ToolError::InvalidInput { .. }));
    }

    #[test]
    fn list_respects_limit() {
        let tasks = TaskList::new();
        let owner = UserId::new();
        for n in 0..5 {
            tasks.add(owner, format!("task {n}"), None, None);
        }
        let listed = tasks.list(owner, false, 3);
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].title, "task 0");
    }
}
