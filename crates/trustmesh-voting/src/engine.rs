use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use trustmesh_broker::{ChannelManager, PublishOptions};
use trustmesh_types::{AgentId, SessionId, encode};

use crate::error::{Result, VoteError};
use crate::session::{
    Ballot, CloseReason, SessionAnnouncement, SessionClosed, SessionState, VotingSession,
};
use crate::tally::{SessionOutcome, Tally, tally};
use crate::weights::WeightSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingConfig {
    /// A second ballot from the same voter replaces the first instead of
    /// being rejected.
    #[serde(default)]
    pub allow_revision: bool,
    #[serde(default = "default_announce_route")]
    pub announce_route: String,
    #[serde(default = "default_announce_timeout_ms")]
    pub announce_timeout_ms: u64,
    /// How long a closed session stays queryable before it is pruned.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

fn default_announce_route() -> String {
    "voting.sessions".into()
}

fn default_announce_timeout_ms() -> u64 {
    5_000
}

fn default_retention_secs() -> u64 {
    3_600
}

fn default_prune_interval_secs() -> u64 {
    60
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            allow_revision: false,
            announce_route: default_announce_route(),
            announce_timeout_ms: default_announce_timeout_ms(),
            retention_secs: default_retention_secs(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

struct SessionEntry {
    session: VotingSession,
    notifier: Option<oneshot::Sender<SessionClosed>>,
    /// Stops the deadline timer once the session closes.
    timer: CancellationToken,
}

/// Handle returned by `open_session`.
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: SessionId,
    rx: oneshot::Receiver<SessionClosed>,
}

impl SessionTicket {
    /// Wait for the session to close. Ending the wait does not close the session.
    pub async fn wait(self, timeout: Duration, cancel: &CancellationToken) -> Result<SessionClosed> {
        let session_id = self.session_id;
        tokio::select! {
            closed = tokio::time::timeout(timeout, self.rx) => match closed {
                Ok(Ok(closed)) => Ok(closed),
                Ok(Err(_)) => Err(VoteError::NotifierDropped(session_id)),
                Err(_) => Err(VoteError::Timeout(format!(
                    "session {session_id} still open after {} ms",
                    timeout.as_millis()
                ))),
            },
            _ = cancel.cancelled() => Err(VoteError::Cancelled(format!("wait for session {session_id}"))),
        }
    }
}

/// Session-scoped weighted voting.
///
/// Casting is serialized per session. Weights are read from the
/// [`WeightSource`] at cast time and stored on the ballot, so a reputation
/// update never changes a ballot already cast.
pub struct VotingEngine {
    config: VotingConfig,
    weights: Arc<dyn WeightSource>,
    broker: Option<Arc<ChannelManager>>,
    sessions: DashMap<SessionId, Arc<Mutex<SessionEntry>>>,
    shutdown: CancellationToken,
}

impl VotingEngine {
    pub fn new(config: VotingConfig, weights: Arc<dyn WeightSource>) -> Self {
        Self {
            config,
            weights,
            broker: None,
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Announce new sessions through `broker`.
    pub fn with_broker(mut self, broker: Arc<ChannelManager>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn config(&self) -> &VotingConfig {
        &self.config
    }

    fn entry(&self, session_id: SessionId) -> Result<Arc<Mutex<SessionEntry>>> {
        self.sessions
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or(VoteError::SessionNotFound(session_id))
    }

    /// Open a session that closes at `deadline`, or earlier once every
    /// eligible voter has voted.
    pub async fn open_session(
        self: &Arc<Self>,
        proposal_id: impl Into<String>,
        eligible: BTreeSet<AgentId>,
        deadline: DateTime<Utc>,
        quorum: f64,
    ) -> Result<SessionTicket> {
        if !(0.0..=1.0).contains(&quorum) {
            return Err(VoteError::InvalidQuorum(quorum));
        }
        if eligible.is_empty() {
            return Err(VoteError::InvalidSession("no eligible voters".into()));
        }
        let now = Utc::now();
        if deadline <= now {
            return Err(VoteError::InvalidSession(format!(
                "deadline {deadline} is not in the future"
            )));
        }

        let session = VotingSession::new(proposal_id, eligible, deadline, quorum);
        let session_id = session.id;
        let announcement = SessionAnnouncement::from(&session);
        let (tx, rx) = oneshot::channel();
        let timer = self.shutdown.child_token();

        tracing::info!(
            session_id = %session_id,
            proposal_id = %session.proposal_id,
            voters = session.eligible_voters.len(),
            quorum,
            %deadline,
            "Voting session opened"
        );
        self.sessions.insert(
            session_id,
            Arc::new(Mutex::new(SessionEntry {
                session,
                notifier: Some(tx),
                timer: timer.clone(),
            })),
        );

        let engine = Arc::clone(self);
        let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = engine.close_with(session_id, CloseReason::Deadline).await {
                        tracing::debug!(session_id = %session_id, "Deadline close skipped: {}", e);
                    }
                }
            }
        });

        self.announce(&announcement).await;
        Ok(SessionTicket { session_id, rx })
    }

    async fn announce(&self, announcement: &SessionAnnouncement) {
        let Some(broker) = &self.broker else {
            return;
        };
        let body = match encode(announcement) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(session_id = %announcement.session_id, "Failed to encode announcement: {}", e);
                return;
            }
        };
        let options = PublishOptions::default()
            .with_timeout(Duration::from_millis(self.config.announce_timeout_ms));
        if let Err(e) = broker
            .publish(&self.config.announce_route, body, options)
            .await
        {
            tracing::warn!(session_id = %announcement.session_id, "Session announcement failed: {}", e);
        }
    }

    /// Cast (or, with revision enabled, replace) a ballot.
    pub async fn cast_vote(
        &self,
        session_id: SessionId,
        voter: AgentId,
        choice: impl Into<String>,
    ) -> Result<Ballot> {
        let choice = choice.into();
        if choice.trim().is_empty() {
            return Err(VoteError::EmptyChoice);
        }
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;

        if !entry.session.is_open() {
            return Err(VoteError::SessionClosed(session_id));
        }
        if Utc::now() >= entry.session.deadline {
            self.finish(&mut entry, CloseReason::Deadline);
            return Err(VoteError::SessionClosed(session_id));
        }
        if !entry.session.is_eligible(&voter) {
            return Err(VoteError::NotEligible { session_id, voter });
        }
        let revising = entry.session.ballots.contains_key(&voter);
        if revising && !self.config.allow_revision {
            return Err(VoteError::AlreadyVoted { session_id, voter });
        }

        let ballot = Ballot::new(voter, choice, self.weights.weight_of(&voter));
        tracing::debug!(
            session_id = %session_id,
            voter = %voter,
            choice = %ballot.choice,
            weight = ballot.weight,
            revising,
            "Ballot cast"
        );
        entry.session.ballots.insert(voter, ballot.clone());

        if entry.session.all_voted() {
            self.finish(&mut entry, CloseReason::AllVoted);
        }
        Ok(ballot)
    }

    /// Close a session now. Closing an already-closed session returns its
    /// recorded result.
    pub async fn close_session(&self, session_id: SessionId) -> Result<SessionClosed> {
        self.close_with(session_id, CloseReason::Manual).await
    }

    async fn close_with(&self, session_id: SessionId, reason: CloseReason) -> Result<SessionClosed> {
        let entry = self.entry(session_id)?;
        let mut entry = entry.lock().await;
        if let Some(closed) = entry.session.closed.clone() {
            return Ok(closed);
        }
        Ok(self.finish(&mut entry, reason))
    }

    fn finish(&self, entry: &mut SessionEntry, reason: CloseReason) -> SessionClosed {
        let session = &mut entry.session;
        session.state = SessionState::Tallying;
        let (outcome, tally) = tally(
            session.ballots.values(),
            session.eligible_voters.len(),
            session.quorum,
        );
        session.state = SessionState::Closed;

        let closed = SessionClosed {
            session_id: session.id,
            reason,
            outcome,
            tally,
            closed_at: Utc::now(),
        };
        session.closed = Some(closed.clone());

        match &closed.outcome {
            SessionOutcome::NoQuorum {
                participation,
                required,
            } => tracing::warn!(
                session_id = %session.id,
                ?reason,
                participation,
                required,
                "Voting session closed without quorum"
            ),
            outcome => tracing::info!(
                session_id = %session.id,
                ?reason,
                decision = outcome.decision().unwrap_or_default(),
                ballots = closed.tally.ballots,
                "Voting session closed"
            ),
        }

        entry.timer.cancel();
        if let Some(tx) = entry.notifier.take() {
            let _ = tx.send(closed.clone());
        }
        closed
    }

    /// Recompute the outcome from the session's current ballot set without
    /// changing the session.
    pub async fn retally(&self, session_id: SessionId) -> Result<(SessionOutcome, Tally)> {
        let entry = self.entry(session_id)?;
        let entry = entry.lock().await;
        let session = &entry.session;
        Ok(tally(
            session.ballots.values(),
            session.eligible_voters.len(),
            session.quorum,
        ))
    }

    pub async fn session(&self, session_id: SessionId) -> Result<VotingSession> {
        let entry = self.entry(session_id)?;
        let session = entry.lock().await.session.clone();
        Ok(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Drop closed sessions that closed before `cutoff`. Returns how many were removed.
    pub async fn prune_closed(&self, cutoff: DateTime<Utc>) -> usize {
        let entries: Vec<_> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut removed = 0;
        for (id, entry) in entries {
            let expired = entry
                .lock()
                .await
                .session
                .closed
                .as_ref()
                .is_some_and(|c| c.closed_at < cutoff);
            if expired && self.sessions.remove(&id).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Prune sessions closed longer than the configured retention until
    /// `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.config.prune_interval_secs.max(1));
        let retention = chrono::Duration::from_std(Duration::from_secs(self.config.retention_secs))
            .unwrap_or(chrono::Duration::MAX);
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Voting loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let cutoff = Utc::now()
                        .checked_sub_signed(retention)
                        .unwrap_or(DateTime::<Utc>::MIN_UTC);
                    let removed = self.prune_closed(cutoff).await;
                    if removed > 0 {
                        tracing::debug!(removed, "Pruned closed voting sessions");
                    }
                }
            }
        }
    }

    /// Close every open session, notifying its ticket, then stop all
    /// deadline timers. Returns how many sessions were closed.
    pub async fn shutdown(&self) -> usize {
        let entries: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut closed = 0;
        for entry in entries {
            let mut entry = entry.lock().await;
            if entry.session.is_open() {
                self.finish(&mut entry, CloseReason::Shutdown);
                closed += 1;
            }
        }
        self.shutdown.cancel();
        if closed > 0 {
            tracing::info!(closed, "Open voting sessions closed on shutdown");
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use trustmesh_broker::{ChannelManagerConfig, InMemoryBroker};
    use trustmesh_types::decode;
    use uuid::Uuid;

    fn engine_with(weights: BTreeMap<AgentId, f64>, config: VotingConfig) -> Arc<VotingEngine> {
        Arc::new(VotingEngine::new(config, Arc::new(weights)))
    }

    fn voters(n: usize) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = (0..n).map(|_| Uuid::new_v4()).collect();
        ids.sort();
        ids
    }

    fn in_a_minute() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(60)
    }

    #[tokio::test]
    async fn test_weighted_vote_closes_when_all_voted() {
        let ids = voters(2);
        let weights = BTreeMap::from([(ids[0], 0.7), (ids[1], 0.3)]);
        let engine = engine_with(weights, VotingConfig::default());
        let ticket = engine
            .open_session("p-1", ids.iter().copied().collect(), in_a_minute(), 0.5)
            .await
            .unwrap();
        let session_id = ticket.session_id;

        let ballot = engine.cast_vote(session_id, ids[0], "x").await.unwrap();
        assert_eq!(ballot.weight, 0.7);
        engine.cast_vote(session_id, ids[1], "y").await.unwrap();

        let closed = ticket
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(closed.reason, CloseReason::AllVoted);
        assert_eq!(closed.outcome, SessionOutcome::Winner { choice: "x".into() });

        let err = engine.cast_vote(session_id, ids[1], "x").await.unwrap_err();
        assert_eq!(err, VoteError::SessionClosed(session_id));
        assert_eq!(
            engine.session(session_id).await.unwrap().state,
            SessionState::Closed
        );
    }

    #[tokio::test]
    async fn test_rejects_ineligible_and_duplicate_voters() {
        let ids = voters(3);
        let engine = engine_with(BTreeMap::new(), VotingConfig::default());
        let ticket = engine
            .open_session("p-2", ids[..2].iter().copied().collect(), in_a_minute(), 0.5)
            .await
            .unwrap();
        let session_id = ticket.session_id;

        let err = engine.cast_vote(session_id, ids[2], "x").await.unwrap_err();
        assert!(matches!(err, VoteError::NotEligible { .. }));

        let ballot = engine.cast_vote(session_id, ids[0], "x").await.unwrap();
        assert_eq!(ballot.weight, 0.0, "unknown voters weigh nothing");
        let err = engine.cast_vote(session_id, ids[0], "y").await.unwrap_err();
        assert!(matches!(err, VoteError::AlreadyVoted { .. }));
        assert!(matches!(
            engine.cast_vote(session_id, ids[1], " ").await,
            Err(VoteError::EmptyChoice)
        ));
    }

    #[tokio::test]
    async fn test_revision_replaces_prior_ballot() {
        let ids = voters(3);
        let weights = BTreeMap::from([(ids[0], 0.5), (ids[1], 0.3), (ids[2], 0.2)]);
        let config = VotingConfig {
            allow_revision: true,
            ..VotingConfig::default()
        };
        let engine = engine_with(weights, config);
        let ticket = engine
            .open_session("p-3", ids.iter().copied().collect(), in_a_minute(), 0.0)
            .await
            .unwrap();
        let session_id = ticket.session_id;

        engine.cast_vote(session_id, ids[0], "x").await.unwrap();
        engine.cast_vote(session_id, ids[1], "y").await.unwrap();
        engine.cast_vote(session_id, ids[0], "y").await.unwrap();

        let (outcome, tally) = engine.retally(session_id).await.unwrap();
        assert_eq!(outcome.decision(), Some("y"));
        assert_eq!(tally.ballots, 2);
        assert_eq!(tally.weight_of("x"), 0.0);
    }

    #[tokio::test]
    async fn test_deadline_closes_without_quorum() {
        let ids = voters(4);
        let engine = engine_with(BTreeMap::from([(ids[0], 1.0)]), VotingConfig::default());
        let deadline = Utc::now() + chrono::Duration::milliseconds(100);
        let ticket = engine
            .open_session("p-4", ids.iter().copied().collect(), deadline, 0.5)
            .await
            .unwrap();
        engine.cast_vote(ticket.session_id, ids[0], "x").await.unwrap();

        let closed = ticket
            .wait(Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(closed.reason, CloseReason::Deadline);
        assert_eq!(
            closed.outcome,
            SessionOutcome::NoQuorum {
                participation: 0.25,
                required: 0.5
            }
        );
    }

    #[tokio::test]
    async fn test_manual_close_is_idempotent() {
        let ids = voters(2);
        let engine = engine_with(BTreeMap::new(), VotingConfig::default());
        let ticket = engine
            .open_session("p-5", ids.iter().copied().collect(), in_a_minute(), 0.0)
            .await
            .unwrap();
        let session_id = ticket.session_id;

        let first = engine.close_session(session_id).await.unwrap();
        let second = engine.close_session(session_id).await.unwrap();
        assert_eq!(first, second);
        assert!(matches!(first.outcome, SessionOutcome::NoQuorum { .. }));

        let closed = ticket
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(closed.reason, CloseReason::Manual);

        assert_eq!(engine.prune_closed(Utc::now() + chrono::Duration::seconds(1)).await, 1);
        assert!(matches!(
            engine.close_session(session_id).await,
            Err(VoteError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_open_sessions_and_notifies() {
        let ids = voters(3);
        let weights = BTreeMap::from([(ids[0], 0.6), (ids[1], 0.4)]);
        let engine = engine_with(weights, VotingConfig::default());
        let open = engine
            .open_session("p-7", ids.iter().copied().collect(), in_a_minute(), 0.5)
            .await
            .unwrap();
        let done = engine
            .open_session("p-8", ids[..1].iter().copied().collect(), in_a_minute(), 0.5)
            .await
            .unwrap();
        engine.cast_vote(open.session_id, ids[0], "x").await.unwrap();
        engine.cast_vote(open.session_id, ids[1], "x").await.unwrap();
        engine.cast_vote(done.session_id, ids[0], "y").await.unwrap();

        assert_eq!(engine.shutdown().await, 1);

        let closed = open
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(closed.reason, CloseReason::Shutdown);
        assert_eq!(closed.outcome, SessionOutcome::Winner { choice: "x".into() });
        let finished = done
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(finished.reason, CloseReason::AllVoted);
        assert!(matches!(
            engine.cast_vote(closed.session_id, ids[2], "y").await,
            Err(VoteError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_run_prunes_sessions_past_retention() {
        let ids = voters(1);
        let config = VotingConfig {
            retention_secs: 0,
            prune_interval_secs: 1,
            ..VotingConfig::default()
        };
        let engine = engine_with(BTreeMap::new(), config);
        let closed = engine
            .open_session("p-9", ids.iter().copied().collect(), in_a_minute(), 0.0)
            .await
            .unwrap();
        let _kept = engine
            .open_session("p-10", ids.iter().copied().collect(), in_a_minute(), 0.0)
            .await
            .unwrap();
        engine.close_session(closed.session_id).await.unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().run(shutdown.clone()));
        for _ in 0..200 {
            if engine.session_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(engine.session_count(), 1, "open session is never pruned");
        assert!(matches!(
            engine.session(closed.session_id).await,
            Err(VoteError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_session_validates_arguments() {
        let engine = engine_with(BTreeMap::new(), VotingConfig::default());
        let eligible: BTreeSet<AgentId> = voters(1).into_iter().collect();
        assert!(matches!(
            engine.open_session("p", eligible.clone(), in_a_minute(), 1.5).await,
            Err(VoteError::InvalidQuorum(_))
        ));
        assert!(matches!(
            engine.open_session("p", BTreeSet::new(), in_a_minute(), 0.5).await,
            Err(VoteError::InvalidSession(_))
        ));
        assert!(matches!(
            engine
                .open_session("p", eligible, Utc::now() - chrono::Duration::seconds(1), 0.5)
                .await,
            Err(VoteError::InvalidSession(_))
        ));
        assert_eq!(engine.session_count(), 0);
    }

    #[tokio::test]
    async fn test_session_is_announced_on_broker() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(ChannelManager::new(
            Arc::new(broker.clone()),
            ChannelManagerConfig::default(),
        ));
        manager.start();
        manager
            .wait_connected(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();

        let engine = Arc::new(
            VotingEngine::new(VotingConfig::default(), Arc::new(BTreeMap::new()))
                .with_broker(manager),
        );
        let ids = voters(2);
        let ticket = engine
            .open_session("p-6", ids.iter().copied().collect(), in_a_minute(), 0.5)
            .await
            .unwrap();

        let messages = broker.take_messages("voting.sessions");
        assert_eq!(messages.len(), 1);
        let announcement: SessionAnnouncement = decode(&messages[0].body).unwrap();
        assert_eq!(announcement.session_id, ticket.session_id);
        assert_eq!(announcement.eligible_voters, ids);
    }
}
