//! EigenTrust power iteration over an index-mapped sparse matrix.
//!
//! Each row of local trust is normalised into `C`; rows with no positive
//! outgoing trust become uniform over every other agent. Starting from the
//! prior `p`, the iteration `v' = (1-ε)·Cᵀ·v + ε·p` runs until the L1
//! residual drops below the threshold or the iteration budget is spent.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use trustmesh_types::AgentId;

use crate::matrix::{TrustMatrix, TrustVector};

/// Pre-trusted distribution the iteration is damped towards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "seeds", rename_all = "snake_case")]
pub enum Prior {
    #[default]
    Uniform,
    /// Uniform over the seed agents that are known; uniform over everyone if
    /// none of them are.
    Seeded(BTreeSet<AgentId>),
}

impl Prior {
    fn weights(&self, agents: &[AgentId]) -> Vec<f64> {
        let n = agents.len();
        if let Prior::Seeded(seeds) = self {
            let known = agents.iter().filter(|a| seeds.contains(a)).count();
            if known > 0 {
                let share = 1.0 / known as f64;
                return agents
                    .iter()
                    .map(|a| if seeds.contains(a) { share } else { 0.0 })
                    .collect();
            }
        }
        vec![1.0 / n as f64; n]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationParams {
    /// Weight ε of the prior in each step.
    pub damping: f64,
    /// L1 residual below which the iteration stops.
    pub threshold: f64,
    pub max_iterations: u32,
}

impl Default for IterationParams {
    fn default() -> Self {
        Self {
            damping: 0.15,
            threshold: 1e-6,
            max_iterations: 100,
        }
    }
}

/// How a recomputation ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub iterations: u32,
    /// L1 distance between the last two iterates.
    pub residual: f64,
    pub converged: bool,
    pub agents: usize,
}

impl ConvergenceReport {
    fn trivial(agents: usize) -> Self {
        Self {
            iterations: 0,
            residual: 0.0,
            converged: true,
            agents,
        }
    }
}

/// Compute global trust for `agents` from local trust `local`.
///
/// Entries of `local` naming agents outside `agents` are ignored.
pub fn power_iteration(
    agents: &[AgentId],
    local: &TrustMatrix,
    prior: &Prior,
    params: IterationParams,
) -> (TrustVector, ConvergenceReport) {
    let n = agents.len();
    match n {
        0 => return (TrustVector::new(), ConvergenceReport::trivial(0)),
        1 => {
            return (
                TrustVector::from_values([(agents[0], 1.0)]),
                ConvergenceReport::trivial(1),
            );
        }
        _ => {}
    }

    let index: BTreeMap<AgentId, usize> =
        agents.iter().enumerate().map(|(i, a)| (*a, i)).collect();

    // Normalised sparse rows; `None` marks a dangling row.
    let rows: Vec<Option<Vec<(usize, f64)>>> = agents
        .iter()
        .map(|from| {
            let entries: Vec<(usize, f64)> = local
                .row(*from)
                .into_iter()
                .flatten()
                .filter_map(|(to, s)| index.get(to).map(|&j| (j, *s)))
                .collect();
            let total: f64 = entries.iter().map(|(_, s)| s).sum();
            (total > 0.0).then(|| entries.into_iter().map(|(j, s)| (j, s / total)).collect())
        })
        .collect();

    let prior = prior.weights(agents);
    let damping = params.damping.clamp(0.0, 1.0);
    let spread = 1.0 / (n - 1) as f64;

    let mut current = prior.clone();
    let mut next = vec![0.0; n];
    let mut report = ConvergenceReport {
        iterations: 0,
        residual: f64::INFINITY,
        converged: false,
        agents: n,
    };

    while report.iterations < params.max_iterations {
        next.iter_mut().for_each(|x| *x = 0.0);
        let mut dangling_mass = 0.0;
        for (i, row) in rows.iter().enumerate() {
            match row {
                Some(entries) => {
                    for &(j, c) in entries {
                        next[j] += c * current[i];
                    }
                }
                None => {
                    dangling_mass += current[i];
                    next[i] -= current[i] * spread;
                }
            }
        }
        let residual = next
            .iter_mut()
            .zip(prior.iter())
            .zip(current.iter())
            .map(|((x, p), v)| {
                *x = (1.0 - damping) * (*x + dangling_mass * spread) + damping * p;
                (*x - v).abs()
            })
            .sum::<f64>();

        std::mem::swap(&mut current, &mut next);
        report.iterations += 1;
        report.residual = residual;
        if residual < params.threshold {
            report.converged = true;
            break;
        }
    }

    let vector = TrustVector::from_values(agents.iter().copied().zip(current));
    (vector, report)
}
