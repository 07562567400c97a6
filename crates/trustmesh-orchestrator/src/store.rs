use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use trustmesh_types::{Result, Task, TaskId, TaskResult, TaskState};

/// A task as held by the store, with its result once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTask {
    pub task: Task,
    pub result: Option<TaskResult>,
}

/// Durable task storage. Owns a task once it reaches a terminal state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Upsert the current state of a non-terminal task.
    async fn persist(&self, task: &Task) -> Result<()>;

    async fn load_by_state(&self, state: TaskState) -> Result<Vec<Task>>;

    /// Record the terminal state of a task.
    ///
    /// Repeating the same terminal state is a no-op; a different terminal
    /// state for an already-terminal task is `TerminalConflict`.
    async fn mark_terminal(&self, task_id: TaskId, state: TaskState, result: &TaskResult)
    -> Result<()>;

    async fn get(&self, task_id: TaskId) -> Result<Option<StoredTask>>;
}
