use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use trustmesh_types::{AgentId, SessionId};

use crate::tally::{SessionOutcome, Tally};

/// Voting session lifecycle. Ballots are only accepted while `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Tallying,
    Closed,
}

/// One voter's choice. The weight is fixed when the ballot is cast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ballot {
    pub voter_id: AgentId,
    pub choice: String,
    pub weight: f64,
    pub cast_at: DateTime<Utc>,
}

impl Ballot {
    pub fn new(voter_id: AgentId, choice: impl Into<String>, weight: f64) -> Self {
        Self {
            voter_id,
            choice: choice.into(),
            weight,
            cast_at: Utc::now(),
        }
    }
}

/// Why a session stopped accepting ballots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    Deadline,
    AllVoted,
    Manual,
    /// The engine stopped while the session was still open.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingSession {
    pub id: SessionId,
    pub proposal_id: String,
    pub eligible_voters: BTreeSet<AgentId>,
    pub ballots: BTreeMap<AgentId, Ballot>,
    pub deadline: DateTime<Utc>,
    /// Minimum fraction of eligible voters that must cast a ballot.
    pub quorum: f64,
    pub state: SessionState,
    pub opened_at: DateTime<Utc>,
    pub closed: Option<SessionClosed>,
}

impl VotingSession {
    pub fn new(
        proposal_id: impl Into<String>,
        eligible_voters: BTreeSet<AgentId>,
        deadline: DateTime<Utc>,
        quorum: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id: proposal_id.into(),
            eligible_voters,
            ballots: BTreeMap::new(),
            deadline,
            quorum,
            state: SessionState::Open,
            opened_at: Utc::now(),
            closed: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn is_eligible(&self, voter: &AgentId) -> bool {
        self.eligible_voters.contains(voter)
    }

    pub fn all_voted(&self) -> bool {
        self.ballots.len() >= self.eligible_voters.len()
    }

    pub fn participation(&self) -> f64 {
        if self.eligible_voters.is_empty() {
            0.0
        } else {
            self.ballots.len() as f64 / self.eligible_voters.len() as f64
        }
    }
}

/// Final result of a session, delivered once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClosed {
    pub session_id: SessionId,
    pub reason: CloseReason,
    pub outcome: SessionOutcome,
    pub tally: Tally,
    pub closed_at: DateTime<Utc>,
}

/// Published on the session announcement route when a session opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAnnouncement {
    pub session_id: SessionId,
    pub proposal_id: String,
    pub eligible_voters: Vec<AgentId>,
    pub deadline: DateTime<Utc>,
    pub quorum: f64,
}

impl From<&VotingSession> for SessionAnnouncement {
    fn from(session: &VotingSession) -> Self {
        Self {
            session_id: session.id,
            proposal_id: session.proposal_id.clone(),
            eligible_voters: session.eligible_voters.iter().copied().collect(),
            deadline: session.deadline,
            quorum: session.quorum,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participation_counts_eligible_voters() {
        let voters: BTreeSet<AgentId> = (0..4).map(|_| Uuid::new_v4()).collect();
        let first = *voters.iter().next().unwrap();
        let mut session = VotingSession::new("p-1", voters, Utc::now(), 0.5);
        assert_eq!(session.participation(), 0.0);

        session.ballots.insert(first, Ballot::new(first, "x", 0.2));
        assert_eq!(session.participation(), 0.25);
        assert!(!session.all_voted());
    }

    #[test]
    fn test_announcement_uses_camel_case() {
        let session = VotingSession::new("p-1", BTreeSet::new(), Utc::now(), 0.5);
        let json = serde_json::to_value(SessionAnnouncement::from(&session)).unwrap();
        assert!(json.get("proposalId").is_some());
        assert!(json.get("eligibleVoters").is_some());
        assert_eq!(json["quorum"], 0.5);
    }
}
