use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trustmesh_types::AgentId;

/// Decayed weights below this are dropped from the interaction log.
pub const PRUNE_THRESHOLD: f64 = 1e-6;

/// One agent's signed judgement of another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub from: AgentId,
    pub to: AgentId,
    /// Positive for a satisfactory interaction, negative otherwise.
    pub score: f64,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(from: AgentId, to: AgentId, score: f64) -> Self {
        Self {
            from,
            to,
            score,
            observed_at: Utc::now(),
        }
    }

    pub fn at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    pub fn is_self(&self) -> bool {
        self.from == self.to
    }
}

/// `0.5^(age / half_life)`. Observations from the future count fully; a zero
/// half-life disables decay.
pub fn decay_weight(age: chrono::Duration, half_life: Duration) -> f64 {
    if half_life.is_zero() {
        return 1.0;
    }
    let age_secs = age.num_milliseconds().max(0) as f64 / 1000.0;
    0.5f64.powf(age_secs / half_life.as_secs_f64())
}

/// Sparse local-trust matrix `s_ij >= 0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustMatrix {
    rows: BTreeMap<AgentId, BTreeMap<AgentId, f64>>,
}

impl TrustMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `s_from,to`. Non-positive values and self-trust are not stored.
    pub fn set(&mut self, from: AgentId, to: AgentId, value: f64) {
        if from == to {
            return;
        }
        if value > 0.0 && value.is_finite() {
            self.rows.entry(from).or_default().insert(to, value);
        } else if let Some(row) = self.rows.get_mut(&from) {
            row.remove(&to);
            if row.is_empty() {
                self.rows.remove(&from);
            }
        }
    }

    pub fn get(&self, from: AgentId, to: AgentId) -> f64 {
        self.rows
            .get(&from)
            .and_then(|row| row.get(&to))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn row(&self, from: AgentId) -> Option<&BTreeMap<AgentId, f64>> {
        self.rows.get(&from)
    }

    /// Every agent that appears on either side of a stored entry.
    pub fn agents(&self) -> BTreeSet<AgentId> {
        self.rows
            .iter()
            .flat_map(|(from, row)| std::iter::once(*from).chain(row.keys().copied()))
            .collect()
    }

    /// Number of stored (positive) entries.
    pub fn entry_count(&self) -> usize {
        self.rows.values().map(BTreeMap::len).sum()
    }

    /// Build local trust `s_ij = max(sum of decayed scores, 0)` from raw observations.
    pub fn from_observations<'a>(
        observations: impl IntoIterator<Item = &'a Observation>,
        now: DateTime<Utc>,
        half_life: Duration,
    ) -> Self {
        let mut sums: BTreeMap<(AgentId, AgentId), f64> = BTreeMap::new();
        for obs in observations {
            if obs.is_self() {
                continue;
            }
            let weight = decay_weight(now - obs.observed_at, half_life);
            if weight < PRUNE_THRESHOLD {
                continue;
            }
            *sums.entry((obs.from, obs.to)).or_default() += weight * obs.score;
        }
        let mut matrix = Self::new();
        for ((from, to), sum) in sums {
            matrix.set(from, to, sum);
        }
        matrix
    }
}

/// Global trust vector; values sum to 1.0 when non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustVector {
    values: BTreeMap<AgentId, f64>,
}

impl TrustVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw values, renormalising to sum 1.0.
    pub fn from_values(values: impl IntoIterator<Item = (AgentId, f64)>) -> Self {
        let mut vector = Self {
            values: values
                .into_iter()
                .map(|(id, v)| (id, if v.is_finite() { v.max(0.0) } else { 0.0 }))
                .collect(),
        };
        vector.normalize();
        vector
    }

    /// Uniform over `agents`.
    pub fn uniform<'a>(agents: impl IntoIterator<Item = &'a AgentId>) -> Self {
        Self::from_values(agents.into_iter().map(|id| (*id, 1.0)))
    }

    pub fn normalize(&mut self) {
        let sum: f64 = self.values.values().sum();
        if sum > 0.0 {
            for v in self.values.values_mut() {
                *v /= sum;
            }
        } else if !self.values.is_empty() {
            let share = 1.0 / self.values.len() as f64;
            for v in self.values.values_mut() {
                *v = share;
            }
        }
    }

    /// Trust of `agent`, zero when unknown.
    pub fn get(&self, agent: &AgentId) -> f64 {
        self.values.get(agent).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.values.contains_key(agent)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.values.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, &f64)> {
        self.values.iter()
    }

    /// The `n` most trusted agents, highest first, ties by id.
    pub fn top(&self, n: usize) -> Vec<(AgentId, f64)> {
        let mut ranked: Vec<_> = self.values.iter().map(|(k, v)| (*k, *v)).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_decay_halves_per_half_life() {
        let half_life = Duration::from_secs(3600);
        assert!((decay_weight(chrono::Duration::zero(), half_life) - 1.0).abs() < 1e-12);
        assert!((decay_weight(chrono::Duration::hours(1), half_life) - 0.5).abs() < 1e-12);
        assert!((decay_weight(chrono::Duration::hours(2), half_life) - 0.25).abs() < 1e-12);
        assert_eq!(decay_weight(chrono::Duration::hours(-1), half_life), 1.0);
        assert_eq!(decay_weight(chrono::Duration::days(10), Duration::ZERO), 1.0);
    }

    #[test]
    fn test_local_trust_clamps_negative_and_ignores_self() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let observations = vec![
            Observation::new(a, b, 1.0).at(now),
            Observation::new(a, b, 0.5).at(now),
            Observation::new(a, c, 1.0).at(now),
            Observation::new(a, c, -3.0).at(now),
            Observation::new(b, b, 5.0).at(now),
        ];
        let matrix = TrustMatrix::from_observations(&observations, now, Duration::from_secs(60));
        assert!((matrix.get(a, b) - 1.5).abs() < 1e-12);
        assert_eq!(matrix.get(a, c), 0.0, "net-negative trust clamps to zero");
        assert_eq!(matrix.get(b, b), 0.0, "self-trust is ignored");
        assert_eq!(matrix.entry_count(), 1);
    }

    #[test]
    fn test_old_observations_are_pruned() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let ancient = Observation::new(a, b, 1.0).at(now - chrono::Duration::days(365));
        let matrix =
            TrustMatrix::from_observations([&ancient], now, Duration::from_secs(3600));
        assert_eq!(matrix.entry_count(), 0);
    }

    #[test]
    fn test_vector_normalization_and_top() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let vector = TrustVector::from_values([(a, 2.0), (b, 6.0), (c, f64::NAN)]);
        assert!((vector.sum() - 1.0).abs() < 1e-12);
        assert!((vector.get(&b) - 0.75).abs() < 1e-12);
        assert_eq!(vector.get(&c), 0.0);
        assert_eq!(vector.top(1)[0].0, b);
        assert_eq!(vector.get(&Uuid::new_v4()), 0.0);

        let flat = TrustVector::from_values([(a, 0.0), (b, 0.0)]);
        assert!((flat.get(&a) - 0.5).abs() < 1e-12);
    }
}
