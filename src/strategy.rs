//! linkfront/src/strategy.rs
//! Pure selection functions over a non-empty candidate link list.

use crate::link::Link;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Balancing strategy. The set is small and closed, so dispatch is a match
/// rather than runtime module lookup.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    RandomLink,
    LeastConnections,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::RandomLink => "random_link",
            Strategy::LeastConnections => "least_connections",
        })
    }
}

impl Strategy {
    /// Picks one of `candidates`, which must be non-empty. `last` is the
    /// previously selected link, if any; the random source is supplied by
    /// the caller.
    pub fn select<'a, R: Rng>(
        &self,
        candidates: &'a [Arc<Link>],
        last: Option<&Arc<Link>>,
        rng: &mut R,
    ) -> &'a Arc<Link> {
        match self {
            Strategy::RoundRobin => round_robin(candidates, last),
            Strategy::RandomLink => random_link(candidates, rng),
            Strategy::LeastConnections => least_connections(candidates),
        }
    }
}

/// Returns the candidate after `last`, wrapping around; the first candidate
/// when `last` is unset or no longer part of the list. Candidates are the
/// filtered subset for one request, so the rotation is effectively
/// per-priority-partition.
pub fn round_robin<'a>(candidates: &'a [Arc<Link>], last: Option<&Arc<Link>>) -> &'a Arc<Link> {
    let Some(last) = last else {
        return &candidates[0];
    };
    match candidates.iter().position(|link| Arc::ptr_eq(link, last)) {
        Some(index) => &candidates[(index + 1) % candidates.len()],
        None => &candidates[0],
    }
}

/// Picks a candidate with probability proportional to its weight.
pub fn random_link<'a, R: Rng>(candidates: &'a [Arc<Link>], rng: &mut R) -> &'a Arc<Link> {
    let total: u64 = candidates.iter().map(|link| u64::from(link.weight)).sum();
    let mut ticket = rng.gen_range(0..total);
    for link in candidates {
        let weight = u64::from(link.weight);
        if ticket < weight {
            return link;
        }
        ticket -= weight;
    }
    &candidates[candidates.len() - 1]
}

/// Returns the candidate with the lowest `open connections / weight` score;
/// ties go to the earliest candidate.
pub fn least_connections<'a>(candidates: &'a [Arc<Link>]) -> &'a Arc<Link> {
    let score = |link: &Link| link.active_connections() as f64 / f64::from(link.weight);
    let mut best = &candidates[0];
    let mut best_score = score(best);
    for link in &candidates[1..] {
        let link_score = score(link);
        if link_score < best_score {
            best = link;
            best_score = link_score;
        }
    }
    best
}
