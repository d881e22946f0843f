//! Season-stratified experience replay.
//!
//! A capacity-bounded buffer split into four fixed strata, one per quarter
//! of the year. Eviction only ever happens inside the stratum receiving a
//! new experience, so a burst of recent same-season data can never push out
//! older but still-relevant seasonal knowledge. Sampling draws
//! proportionally across the represented strata.

use chrono::{DateTime, Datelike, Utc};
use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::agent::StateKey;

/// One (state, action, reward, next state) tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayExperience {
    pub at: DateTime<Utc>,
    pub state: StateKey,
    pub action_index: usize,
    pub reward: f64,
    pub next_state: StateKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayBuffer {
    capacity: usize,
    strata: [VecDeque<ReplayExperience>; 4],
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(4),
            strata: Default::default(),
        }
    }

    fn quarter(at: DateTime<Utc>) -> usize {
        ((at.month0()) / 3) as usize
    }

    /// Insert an experience into its quarter's stratum, evicting the oldest
    /// entry of that stratum only.
    pub fn push(&mut self, experience: ReplayExperience) {
        let cap = (self.capacity / 4).max(1);
        let stratum = &mut self.strata[Self::quarter(experience.at)];
        stratum.push_back(experience);
        while stratum.len() > cap {
            stratum.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.strata.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample up to `n` experiences, allocated proportionally across the
    /// non-empty strata (every represented season contributes).
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Vec<&ReplayExperience> {
        let total = self.len();
        if total == 0 || n == 0 {
            return Vec::new();
        }
        let n = n.min(total);

        let mut picked = Vec::with_capacity(n);
        for stratum in &self.strata {
            if stratum.is_empty() {
                continue;
            }
            // At least one draw per represented season.
            let share = ((n * stratum.len()) as f64 / total as f64).round() as usize;
            let draws = share.max(1).min(stratum.len());
            picked.extend(stratum.iter().choose_multiple(rng, draws));
        }
        picked.truncate(n);
        picked
    }
}
