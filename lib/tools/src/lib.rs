//! Built-in tools for the speda assistant.
//!
//! - **Tasks**: create, list, complete and delete (confirmed) tasks
//! - **Clock**: current date and time in the user's timezone

pub mod clock;
pub mod tasks;

pub use clock::CurrentDateTime;
pub use tasks::{CompleteTask, CreateTask, DeleteTask, GetTasks, Task, TaskList};

use speda_conversation::ToolRegistry;
use std::sync::Arc;

/// Builds the registry of built-in tools over a shared task list.
#[must_use]
pub fn default_registry(tasks: Arc<TaskList>) -> ToolRegistry {
    ToolRegistry::builder()
        .register(CreateTask::new(Arc::clone(&tasks)))
        .register(GetTasks::new(Arc::clone(&tasks)))
        .register(CompleteTask::new(Arc::clone(&tasks)))
        .register(DeleteTask::new(tasks))
        .register(CurrentDateTime)
        .build()
}
