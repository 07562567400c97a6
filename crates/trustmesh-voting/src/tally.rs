use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::session::Ballot;

/// Weights closer than this are considered tied.
pub const TIE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChoiceTally {
    pub weight: f64,
    pub votes: usize,
}

/// Per-choice totals for a ballot set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub choices: BTreeMap<String, ChoiceTally>,
    pub ballots: usize,
    pub eligible: usize,
    pub participation: f64,
}

impl Tally {
    pub fn weight_of(&self, choice: &str) -> f64 {
        self.choices.get(choice).map(|c| c.weight).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    Winner {
        choice: String,
    },
    /// Several choices within epsilon of the top weight. `resolved` is the
    /// deterministic pick: most raw votes, then the smallest choice.
    Tie {
        resolved: String,
        contenders: Vec<String>,
    },
    NoQuorum {
        participation: f64,
        required: f64,
    },
}

impl SessionOutcome {
    /// The choice the session settled on, if quorum was met.
    pub fn decision(&self) -> Option<&str> {
        match self {
            SessionOutcome::Winner { choice } => Some(choice),
            SessionOutcome::Tie { resolved, .. } => Some(resolved),
            SessionOutcome::NoQuorum { .. } => None,
        }
    }
}

/// Tally a ballot set. Pure: the same ballots give the same result in any order.
pub fn tally<'a, I>(ballots: I, eligible: usize, quorum: f64) -> (SessionOutcome, Tally)
where
    I: IntoIterator<Item = &'a Ballot>,
{
    let mut ballots: Vec<&Ballot> = ballots.into_iter().collect();
    ballots.sort_by(|a, b| a.voter_id.cmp(&b.voter_id));

    let mut choices: BTreeMap<String, ChoiceTally> = BTreeMap::new();
    for ballot in &ballots {
        let entry = choices.entry(ballot.choice.clone()).or_default();
        entry.weight += ballot.weight.max(0.0);
        entry.votes += 1;
    }

    let participation = if eligible == 0 {
        0.0
    } else {
        ballots.len() as f64 / eligible as f64
    };
    let tally = Tally {
        choices,
        ballots: ballots.len(),
        eligible,
        participation,
    };

    if ballots.is_empty() || participation + TIE_EPSILON < quorum {
        return (
            SessionOutcome::NoQuorum {
                participation,
                required: quorum,
            },
            tally,
        );
    }

    let top = tally
        .choices
        .values()
        .map(|c| c.weight)
        .fold(f64::NEG_INFINITY, f64::max);
    let contenders: Vec<(&String, &ChoiceTally)> = tally
        .choices
        .iter()
        .filter(|(_, c)| top - c.weight <= TIE_EPSILON)
        .collect();

    let outcome = match contenders.as_slice() {
        [(choice, _)] => SessionOutcome::Winner {
            choice: (*choice).clone(),
        },
        _ => {
            // BTreeMap order makes the first maximum the smallest choice.
            let most_votes = contenders.iter().map(|(_, c)| c.votes).max().unwrap_or(0);
            let resolved = contenders
                .iter()
                .find(|(_, c)| c.votes == most_votes)
                .map(|(choice, _)| (*choice).clone())
                .unwrap_or_default();
            SessionOutcome::Tie {
                resolved,
                contenders: contenders.iter().map(|(choice, _)| (*choice).clone()).collect(),
            }
        }
    };
    (outcome, tally)
}
