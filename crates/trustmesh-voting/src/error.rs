use thiserror::Error;

use trustmesh_types::{AgentId, SessionId, TrustmeshError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VoteError {
    #[error("Voting session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Voting session {0} is closed")]
    SessionClosed(SessionId),

    #[error("Voter {voter} is not eligible in session {session_id}")]
    NotEligible { session_id: SessionId, voter: AgentId },

    #[error("Voter {voter} already voted in session {session_id}")]
    AlreadyVoted { session_id: SessionId, voter: AgentId },

    #[error("Invalid quorum {0}: must be within [0, 1]")]
    InvalidQuorum(f64),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Empty choice")]
    EmptyChoice,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Session notifier dropped: {0}")]
    NotifierDropped(SessionId),
}

impl From<VoteError> for TrustmeshError {
    fn from(err: VoteError) -> Self {
        match err {
            VoteError::SessionNotFound(id) => TrustmeshError::SessionNotFound(id),
            VoteError::Timeout(msg) => TrustmeshError::Timeout(msg),
            VoteError::Cancelled(msg) => TrustmeshError::Cancelled(msg),
            other => TrustmeshError::Voting(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoteError>;
