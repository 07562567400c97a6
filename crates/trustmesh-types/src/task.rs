use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TrustmeshError;
use crate::{AgentId, TaskId};

/// Task state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Dispatched,
    Executing,
    Completed,
    /// Terminal once persisted. A retryable failure passes through this state
    /// and continues to `Queued` or `DeadLettered` under the same task lock.
    Failed,
    DeadLettered,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::Failed
                | TaskState::DeadLettered
                | TaskState::Cancelled
        )
    }

    /// States that are still owned by the orchestrator.
    pub fn in_flight() -> [TaskState; 3] {
        [TaskState::Queued, TaskState::Dispatched, TaskState::Executing]
    }
}

/// Events that drive task state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskEvent {
    Dispatch,
    Acknowledge,
    AckTimeout,
    Complete,
    Fail,
    Retry,
    Exhaust,
    Cancel,
}

impl TaskState {
    /// Attempt a state transition given an event.
    /// Returns the new state or an error if the transition is invalid.
    pub fn transition(self, event: TaskEvent) -> super::error::Result<TaskState> {
        match (self, event) {
            (TaskState::Queued, TaskEvent::Dispatch) => Ok(TaskState::Dispatched),

            (TaskState::Dispatched, TaskEvent::Acknowledge) => Ok(TaskState::Executing),
            (TaskState::Dispatched, TaskEvent::AckTimeout) => Ok(TaskState::Queued),
            (TaskState::Dispatched, TaskEvent::Fail) => Ok(TaskState::Failed),

            (TaskState::Executing, TaskEvent::Complete) => Ok(TaskState::Completed),
            (TaskState::Executing, TaskEvent::Fail) => Ok(TaskState::Failed),

            (TaskState::Failed, TaskEvent::Retry) => Ok(TaskState::Queued),
            (TaskState::Failed, TaskEvent::Exhaust) => Ok(TaskState::DeadLettered),

            (
                TaskState::Queued | TaskState::Dispatched | TaskState::Executing,
                TaskEvent::Cancel,
            ) => Ok(TaskState::Cancelled),

            (state, event) => Err(TrustmeshError::InvalidStateTransition { from: state, event }),
        }
    }
}

/// The recorded outcome of a task that reached a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub state: TaskState,
    pub agent_id: Option<AgentId>,
    pub payload: Option<Vec<u8>>,
    pub error: Option<String>,
    pub attempt: u32,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(agent_id: AgentId, payload: Vec<u8>, attempt: u32) -> Self {
        Self {
            state: TaskState::Completed,
            agent_id: Some(agent_id),
            payload: Some(payload),
            error: None,
            attempt,
            finished_at: Utc::now(),
        }
    }

    pub fn failure(
        state: TaskState,
        agent_id: Option<AgentId>,
        error: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            state,
            agent_id,
            payload: None,
            error: Some(error.into()),
            attempt,
            finished_at: Utc::now(),
        }
    }
}

/// A unit of work dispatched to one agent at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub kind: String,
    pub payload: Vec<u8>,
    pub priority: i32,
    pub state: TaskState,
    /// 1-based; incremented every time the task goes back to `Queued`.
    pub attempt: u32,
    pub max_attempts: u32,
    pub assigned_agent: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// Earliest time the task may be dispatched again (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    /// Latest time an `Executing` acknowledgment is accepted.
    pub ack_deadline: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// The finished task this one was manually retried from.
    #[serde(default)]
    pub retry_of: Option<TaskId>,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            payload,
            priority: 0,
            state: TaskState::Queued,
            attempt: 1,
            max_attempts: 3,
            assigned_agent: None,
            created_at: now,
            updated_at: now,
            deadline: None,
            not_before: None,
            ack_deadline: None,
            last_error: None,
            retry_of: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the task may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Queued && self.not_before.is_none_or(|t| t <= now)
    }

    /// Apply a state transition event.
    ///
    /// Requeueing events (`Retry`, `AckTimeout`) are refused once attempts are
    /// exhausted and bump `attempt` when accepted.
    pub fn apply_event(&mut self, event: TaskEvent) -> super::error::Result<()> {
        if matches!(event, TaskEvent::Retry | TaskEvent::AckTimeout) && !self.attempts_remaining()
        {
            return Err(TrustmeshError::RetriesExhausted {
                task_id: self.id,
                attempts: self.attempt,
            });
        }
        let next = self.state.transition(event)?;
        match event {
            TaskEvent::Retry | TaskEvent::AckTimeout => {
                self.attempt += 1;
                self.assigned_agent = None;
                self.ack_deadline = None;
            }
            TaskEvent::Acknowledge => {
                self.ack_deadline = None;
            }
            _ => {}
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
