use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use trustmesh_types::{AgentId, Result, TrustmeshError};

use crate::eigentrust::{ConvergenceReport, IterationParams, Prior, power_iteration};
use crate::matrix::{Observation, PRUNE_THRESHOLD, TrustMatrix, TrustVector, decay_weight};
use crate::store::ReputationStore;

/// Configuration for the EigenTrust engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigenTrustConfig {
    #[serde(default = "default_damping")]
    pub damping: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Age at which an observation counts half. Zero disables decay.
    #[serde(default = "default_half_life_secs")]
    pub half_life_secs: u64,
    #[serde(default)]
    pub prior: Prior,
    #[serde(default = "default_recompute_interval_secs")]
    pub recompute_interval_secs: u64,
}

fn default_damping() -> f64 {
    0.15
}

fn default_threshold() -> f64 {
    1e-6
}

fn default_max_iterations() -> u32 {
    100
}

fn default_half_life_secs() -> u64 {
    7 * 24 * 3600
}

fn default_recompute_interval_secs() -> u64 {
    30
}

impl Default for EigenTrustConfig {
    fn default() -> Self {
        Self {
            damping: default_damping(),
            threshold: default_threshold(),
            max_iterations: default_max_iterations(),
            half_life_secs: default_half_life_secs(),
            prior: Prior::default(),
            recompute_interval_secs: default_recompute_interval_secs(),
        }
    }
}

impl EigenTrustConfig {
    pub fn params(&self) -> IterationParams {
        IterationParams {
            damping: self.damping,
            threshold: self.threshold,
            max_iterations: self.max_iterations,
        }
    }

    pub fn half_life(&self) -> Duration {
        Duration::from_secs(self.half_life_secs)
    }
}

/// Immutable trust vector published after each recomputation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustSnapshot {
    /// Zero until the first recomputation (or a vector loaded from the store).
    pub version: u64,
    pub computed_at: Option<DateTime<Utc>>,
    pub vector: TrustVector,
    pub report: Option<ConvergenceReport>,
}

impl TrustSnapshot {
    /// Trust of `agent`, zero when unknown.
    pub fn weight_of(&self, agent: &AgentId) -> f64 {
        self.vector.get(agent)
    }
}

/// EigenTrust-style reputation engine.
///
/// Observations accumulate in a per-pair log. `recompute` decays and prunes
/// the log, runs the power iteration, persists the vector, and publishes a
/// new snapshot. Readers only ever see whole snapshots.
pub struct EigenTrustEngine {
    config: EigenTrustConfig,
    store: Arc<dyn ReputationStore>,
    log: DashMap<(AgentId, AgentId), Vec<(f64, DateTime<Utc>)>>,
    agents: DashSet<AgentId>,
    snapshot_tx: watch::Sender<Arc<TrustSnapshot>>,
    recompute_lock: Mutex<()>,
}

impl EigenTrustEngine {
    pub fn new(config: EigenTrustConfig, store: Arc<dyn ReputationStore>) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(TrustSnapshot::default()));
        Self {
            config,
            store,
            log: DashMap::new(),
            agents: DashSet::new(),
            snapshot_tx,
            recompute_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EigenTrustConfig {
        &self.config
    }

    /// Rebuild the interaction log and last vector from the store.
    pub async fn load(&self) -> Result<()> {
        let observations = self.store.load_observations().await?;
        let count = observations.len();
        for obs in observations {
            self.insert(&obs);
        }
        if let Some(vector) = self.store.load_trust_vector().await? {
            for (agent, _) in vector.iter() {
                self.agents.insert(*agent);
            }
            self.snapshot_tx.send_replace(Arc::new(TrustSnapshot {
                version: 0,
                computed_at: None,
                vector,
                report: None,
            }));
        }
        tracing::info!(observations = count, agents = self.agents.len(), "Reputation state loaded");
        Ok(())
    }

    /// Make an agent part of the next computation even without observations.
    pub fn register_agent(&self, agent: AgentId) {
        self.agents.insert(agent);
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Record an observation. Self-observations are ignored and return `false`.
    pub async fn observe(&self, observation: Observation) -> Result<bool> {
        if observation.is_self() {
            tracing::debug!(agent = %observation.from, "Ignoring self-observation");
            return Ok(false);
        }
        if !observation.score.is_finite() {
            return Err(TrustmeshError::Reputation(format!(
                "non-finite score {} from {}",
                observation.score, observation.from
            )));
        }
        self.store.record_observation(&observation).await?;
        self.insert(&observation);
        Ok(true)
    }

    fn insert(&self, obs: &Observation) {
        self.agents.insert(obs.from);
        self.agents.insert(obs.to);
        if obs.is_self() {
            return;
        }
        self.log
            .entry((obs.from, obs.to))
            .or_default()
            .push((obs.score, obs.observed_at));
    }

    /// Recompute global trust as of `now` and publish a new snapshot.
    pub async fn recompute(&self, now: DateTime<Utc>) -> Result<ConvergenceReport> {
        let _guard = self.recompute_lock.lock().await;
        let half_life = self.config.half_life();

        let mut local = TrustMatrix::new();
        let mut pruned = 0usize;
        for mut entry in self.log.iter_mut() {
            let (from, to) = *entry.key();
            let before = entry.value().len();
            entry
                .value_mut()
                .retain(|(_, at)| decay_weight(now - *at, half_life) >= PRUNE_THRESHOLD);
            pruned += before - entry.value().len();
            let sum: f64 = entry
                .value()
                .iter()
                .map(|(score, at)| score * decay_weight(now - *at, half_life))
                .sum();
            local.set(from, to, sum);
        }
        self.log.retain(|_, observations| !observations.is_empty());

        let mut agents: Vec<AgentId> = self.agents.iter().map(|a| *a.key()).collect();
        agents.sort();

        let (vector, report) =
            power_iteration(&agents, &local, &self.config.prior, self.config.params());
        if report.converged {
            tracing::debug!(
                iterations = report.iterations,
                residual = report.residual,
                "Trust iteration converged"
            );
        } else {
            tracing::warn!(
                iterations = report.iterations,
                residual = report.residual,
                threshold = self.config.threshold,
                "Trust iteration did not converge, publishing last iterate"
            );
        }

        let version = self.snapshot_tx.borrow().version + 1;
        self.snapshot_tx.send_replace(Arc::new(TrustSnapshot {
            version,
            computed_at: Some(now),
            vector: vector.clone(),
            report: Some(report),
        }));
        tracing::info!(version, agents = report.agents, pruned, "Trust snapshot published");

        if let Err(e) = self.store.persist_trust_vector(&vector).await {
            tracing::error!("Failed to persist trust vector: {}", e);
            return Err(e);
        }
        Ok(report)
    }

    /// The current snapshot. Never blocks on a running recomputation.
    pub fn snapshot(&self) -> Arc<TrustSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn weight_of(&self, agent: &AgentId) -> f64 {
        self.snapshot_tx.borrow().weight_of(agent)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TrustSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Recompute on a fixed interval until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.config.recompute_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reputation loop shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.recompute(Utc::now()).await {
                        tracing::error!("Trust recomputation failed: {}", e);
                    }
                }
            }
        }
    }
}
