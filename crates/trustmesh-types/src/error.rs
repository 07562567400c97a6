use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::{TaskEvent, TaskState};

/// How a failure must be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retried under the backoff policy until attempts are exhausted.
    Transient,
    /// Never retried; routed to dead-letter or the error callback.
    Permanent,
    /// A distinguished outcome the caller has to branch on.
    Policy,
    /// Capacity exhausted; back off deliberately before retrying.
    Resource,
}

#[derive(Debug, Error)]
pub enum TrustmeshError {
    #[error("State transition error: cannot transition from {from:?} via {event:?}")]
    InvalidStateTransition { from: TaskState, event: TaskEvent },

    #[error("Task not found: {0}")]
    TaskNotFound(uuid::Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(uuid::Uuid),

    #[error("Voting session not found: {0}")]
    SessionNotFound(uuid::Uuid),

    #[error("Unknown task kind '{0}'")]
    UnknownKind(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Capability mismatch: agent lacks required capability '{0}'")]
    CapabilityMismatch(String),

    #[error("No eligible agent for task kind '{0}'")]
    NoEligibleAgent(String),

    #[error("Circuit breaker open for route '{0}'")]
    CircuitOpen(String),

    #[error("Retries exhausted for task {task_id} after {attempts} attempts")]
    RetriesExhausted { task_id: uuid::Uuid, attempts: u32 },

    #[error("Task {task_id} already terminal as {existing:?}, refusing {requested:?}")]
    TerminalConflict {
        task_id: uuid::Uuid,
        existing: TaskState,
        requested: TaskState,
    },

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Publish for delivery {delivery_tag} was not confirmed: {reason}")]
    Unconfirmed { delivery_tag: u64, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Agent {agent_id} unreachable")]
    AgentUnreachable { agent_id: uuid::Uuid },

    #[error("Resource exhausted: {resource} ({in_use}/{capacity} in use)")]
    ResourceExhausted {
        resource: String,
        in_use: usize,
        capacity: usize,
    },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Voting error: {0}")]
    Voting(String),

    #[error("Reputation error: {0}")]
    Reputation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrustmeshError {
    /// Classify the error according to the retry taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            TrustmeshError::BrokerUnavailable(_)
            | TrustmeshError::Unconfirmed { .. }
            | TrustmeshError::AgentUnreachable { .. }
            | TrustmeshError::Timeout(_)
            | TrustmeshError::Store(_) => ErrorClass::Transient,

            TrustmeshError::NoEligibleAgent(_) | TrustmeshError::CircuitOpen(_) => {
                ErrorClass::Policy
            }

            TrustmeshError::ResourceExhausted { .. } => ErrorClass::Resource,

            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<serde_json::Error> for TrustmeshError {
    fn from(err: serde_json::Error) -> Self {
        TrustmeshError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrustmeshError>;
