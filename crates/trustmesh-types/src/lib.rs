pub mod agent;
pub mod backoff;
pub mod envelope;
pub mod error;
pub mod task;

pub use agent::*;
pub use backoff::*;
pub use envelope::*;
pub use error::*;
pub use task::*;

/// Identifier of a task.
pub type TaskId = uuid::Uuid;

/// Identifier of an agent (worker process).
pub type AgentId = uuid::Uuid;

/// Identifier of a voting session.
pub type SessionId = uuid::Uuid;
