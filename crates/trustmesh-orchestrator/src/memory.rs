use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use trustmesh_types::{Result, Task, TaskId, TaskResult, TaskState, TrustmeshError};

use crate::store::{StoredTask, TaskStore};

/// In-memory task store (default).
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<DashMap<TaskId, StoredTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn persist(&self, task: &Task) -> Result<()> {
        let mut entry = self
            .tasks
            .entry(task.id)
            .or_insert_with(|| StoredTask {
                task: task.clone(),
                result: None,
            });
        let existing = entry.task.state;
        if existing.is_terminal() {
            return Err(TrustmeshError::TerminalConflict {
                task_id: task.id,
                existing,
                requested: task.state,
            });
        }
        entry.task = task.clone();
        Ok(())
    }

    async fn load_by_state(&self, state: TaskState) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|t| t.task.state == state)
            .map(|t| t.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn mark_terminal(
        &self,
        task_id: TaskId,
        state: TaskState,
        result: &TaskResult,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(TrustmeshError::Store(format!(
                "{state:?} is not a terminal state"
            )));
        }
        let mut entry = self
            .tasks
            .get_mut(&task_id)
            .ok_or(TrustmeshError::TaskNotFound(task_id))?;
        let existing = entry.task.state;
        if existing.is_terminal() {
            return if existing == state {
                Ok(())
            } else {
                Err(TrustmeshError::TerminalConflict {
                    task_id,
                    existing,
                    requested: state,
                })
            };
        }
        entry.task.state = state;
        entry.task.updated_at = result.finished_at;
        entry.result = Some(result.clone());
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<Option<StoredTask>> {
        Ok(self.tasks.get(&task_id).map(|t| t.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_mark_terminal_is_idempotent() {
        let store = InMemoryTaskStore::new();
        let task = Task::new("analyze", vec![]);
        store.persist(&task).await.unwrap();

        let result = TaskResult::success(Uuid::new_v4(), b"ok".to_vec(), 1);
        store
            .mark_terminal(task.id, TaskState::Completed, &result)
            .await
            .unwrap();
        store
            .mark_terminal(task.id, TaskState::Completed, &result)
            .await
            .expect("same terminal state twice is a no-op");

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.task.state, TaskState::Completed);
        assert_eq!(stored.result, Some(result));
    }

    #[tokio::test]
    async fn test_conflicting_terminal_state_is_rejected() {
        let store = InMemoryTaskStore::new();
        let task = Task::new("analyze", vec![]);
        store.persist(&task).await.unwrap();

        let done = TaskResult::success(Uuid::new_v4(), vec![], 1);
        store
            .mark_terminal(task.id, TaskState::Completed, &done)
            .await
            .unwrap();

        let failed = TaskResult::failure(TaskState::Failed, None, "boom", 1);
        let err = store
            .mark_terminal(task.id, TaskState::Failed, &failed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrustmeshError::TerminalConflict {
                existing: TaskState::Completed,
                requested: TaskState::Failed,
                ..
            }
        ));

        let err = store.persist(&task).await.unwrap_err();
        assert!(matches!(err, TrustmeshError::TerminalConflict { .. }));
    }

    #[tokio::test]
    async fn test_load_by_state() {
        let store = InMemoryTaskStore::new();
        let queued = Task::new("analyze", vec![]);
        let mut dispatched = Task::new("analyze", vec![]);
        dispatched.state = TaskState::Dispatched;
        store.persist(&queued).await.unwrap();
        store.persist(&dispatched).await.unwrap();

        let found = store.load_by_state(TaskState::Dispatched).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, dispatched.id);
        assert!(store
            .mark_terminal(Uuid::new_v4(), TaskState::Completed, &TaskResult::success(Uuid::new_v4(), vec![], 1))
            .await
            .is_err());
    }
}
