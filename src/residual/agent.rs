//! Residual correction agent.
//!
//! Learns small, bounded adjustments to the planner's price thresholds
//! without ever being allowed to destabilize it. The action space is a
//! fixed symmetric set of price deltas; the selected delta is applied to
//! the battery and EV price limits of the planner's action and then
//! hard-clamped, so the final action can never violate the planner's SoC
//! floor or departure feasibility (modes and powers are never touched).
//!
//! The agent starts in shadow mode, where decisions are logged but never
//! applied. Promotion to advisory requires an explicit audit pass
//! confirming zero constraint violations over a minimum observation
//! window.

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::Display;
use thiserror::Error;
use tracing::debug;

use super::replay::ReplayExperience;
use super::seasonal::SeasonalFeatures;
use crate::config::ResidualConfig;
use crate::domain::{Action, SystemState};
use crate::optimizer::PlannerConstraints;

/// Discretized state the Q table is indexed by.
///
/// Each field is a small bucket index; together they span a few thousand
/// states, which a lookup table covers comfortably.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct StateKey {
    pub price: u8,
    pub soc: u8,
    pub pv: u8,
    pub bias: u8,
    pub bias_trusted: u8,
    pub tod: u8,
}

impl StateKey {
    /// Bucket the continuous state, folding in the seasonal-bias features.
    pub fn from_state(
        state: &SystemState,
        constraints: &PlannerConstraints,
        seasonal: SeasonalFeatures,
    ) -> Self {
        let stats = state.price.stats;
        let price = state.price.current_ct_kwh;
        let price_bucket = if price <= stats.p10 {
            0
        } else if price <= stats.p30 {
            1
        } else if price < stats.p70 {
            2
        } else if price < stats.p90 {
            3
        } else {
            4
        };

        let floor = constraints.floor_soc_percent;
        let max = constraints.max_soc_percent;
        let span = (max - floor).max(1.0);
        let soc_pos = ((state.battery.soc_percent - floor) / span).clamp(0.0, 1.0);
        let soc_bucket = ((soc_pos * 5.0) as u8).min(4);

        let pv_bucket = match state.pv.power_w {
            w if w < 100.0 => 0,
            w if w < 2000.0 => 1,
            _ => 2,
        };

        let bias_bucket = match seasonal.bias_ct {
            b if b < -5.0 => 0,
            b if b <= 5.0 => 1,
            _ => 2,
        };

        let tod_bucket = match state.captured_at.hour() {
            h if !(6..22).contains(&h) => 0,
            h if h < 10 => 1,
            h if h < 17 => 2,
            _ => 3,
        };

        Self {
            price: price_bucket,
            soc: soc_bucket,
            pv: pv_bucket,
            bias: bias_bucket,
            bias_trusted: (seasonal.confidence > 0.5) as u8,
            tod: tod_bucket,
        }
    }
}

/// Shadow: decisions logged only. Advisory: decisions applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum AgentMode {
    Shadow,
    Advisory,
}

/// Why a promotion request was refused.
#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("observation window too short: {observed_days} of {required_days} days")]
    WindowTooShort {
        observed_days: i64,
        required_days: i64,
    },
    #[error("{count} constraint violations recorded during the observation window")]
    ConstraintViolations { count: u64 },
}

/// One learned value row, in persistable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QTableEntry {
    pub key: StateKey,
    pub values: Vec<f64>,
}

/// Persisted form of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTable {
    pub entries: Vec<QTableEntry>,
    pub epsilon: f64,
    pub mode: AgentMode,
    pub shadow_since: DateTime<Utc>,
    pub decision_count: u64,
    pub violation_count: u64,
}

/// Outcome of one delta selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualDecision {
    pub delta_index: usize,
    pub delta_ct: f64,
    /// False in shadow mode: the base action went out unmodified.
    pub applied: bool,
    /// The raw delta would have pushed a limit outside its bounds and was
    /// clamped. Counts against the promotion audit.
    pub clamped: bool,
}

pub struct ResidualRLAgent {
    cfg: ResidualConfig,
    deltas: Vec<f64>,
    q: HashMap<StateKey, Vec<f64>>,
    epsilon: f64,
    mode: AgentMode,
    shadow_since: DateTime<Utc>,
    decision_count: u64,
    violation_count: u64,
}

/// Build the fixed symmetric delta set from the configured clamp width and
/// step, always including zero.
pub fn delta_set(clamp_ct: f64, step_ct: f64) -> Vec<f64> {
    let step = step_ct.abs().max(0.5);
    let n = (clamp_ct.abs() / step).floor() as i64;
    (-n..=n).map(|i| i as f64 * step).collect()
}

impl ResidualRLAgent {
    pub fn new(cfg: ResidualConfig, now: DateTime<Utc>) -> Self {
        let deltas = delta_set(cfg.clamp_ct, cfg.step_ct);
        Self {
            epsilon: cfg.epsilon_start,
            deltas,
            q: HashMap::new(),
            mode: AgentMode::Shadow,
            shadow_since: now,
            decision_count: 0,
            violation_count: 0,
            cfg,
        }
    }

    /// Restore from a persisted table. Entries whose value vector does not
    /// match the current delta set are discarded (the table rebuilds).
    pub fn from_table(cfg: ResidualConfig, table: AgentTable) -> Self {
        let deltas = delta_set(cfg.clamp_ct, cfg.step_ct);
        let q = table
            .entries
            .into_iter()
            .filter(|e| e.values.len() == deltas.len())
            .map(|e| (e.key, e.values))
            .collect();
        Self {
            deltas,
            q,
            epsilon: table.epsilon,
            mode: table.mode,
            shadow_since: table.shadow_since,
            decision_count: table.decision_count,
            violation_count: table.violation_count,
            cfg,
        }
    }

    pub fn table(&self) -> AgentTable {
        let mut entries: Vec<QTableEntry> = self
            .q
            .iter()
            .map(|(key, values)| QTableEntry {
                key: *key,
                values: values.clone(),
            })
            .collect();
        entries.sort_by_key(|e| (e.key.price, e.key.soc, e.key.pv, e.key.bias, e.key.tod));
        AgentTable {
            entries,
            epsilon: self.epsilon,
            mode: self.mode,
            shadow_since: self.shadow_since,
            decision_count: self.decision_count,
            violation_count: self.violation_count,
        }
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn deltas(&self) -> &[f64] {
        &self.deltas
    }

    pub fn violation_count(&self) -> u64 {
        self.violation_count
    }

    fn zero_index(&self) -> usize {
        self.deltas.len() / 2
    }

    fn values_mut(q: &mut HashMap<StateKey, Vec<f64>>, key: StateKey, len: usize) -> &mut Vec<f64> {
        q.entry(key).or_insert_with(|| vec![0.0; len])
    }

    /// Epsilon-greedy delta selection with ties resolved toward the
    /// zero delta, plus epsilon decay.
    fn select_index<R: Rng>(&mut self, key: StateKey, rng: &mut R) -> usize {
        let len = self.deltas.len();
        let index = if rng.gen::<f64>() < self.epsilon {
            rng.gen_range(0..len)
        } else {
            let zero = self.zero_index();
            let values = Self::values_mut(&mut self.q, key, len);
            let mut best = zero;
            for (i, v) in values.iter().enumerate() {
                if *v > values[best] + 1e-12 {
                    best = i;
                }
            }
            best
        };
        self.epsilon = (self.epsilon * self.cfg.epsilon_decay).max(self.cfg.epsilon_min);
        index
    }

    /// Select a delta for this cycle and produce the action to execute.
    /// In shadow mode the base action is returned untouched and the
    /// decision is only logged.
    pub fn decide<R: Rng>(
        &mut self,
        key: StateKey,
        base: &Action,
        rng: &mut R,
    ) -> (Action, ResidualDecision) {
        let delta_index = self.select_index(key, rng);
        let delta_ct = self.deltas[delta_index];
        let (adjusted, clamped) = Self::apply_delta(base, delta_ct);

        self.decision_count += 1;
        if clamped {
            self.violation_count += 1;
        }

        let applied = self.mode == AgentMode::Advisory;
        let decision = ResidualDecision {
            delta_index,
            delta_ct,
            applied,
            clamped,
        };
        debug!(
            delta_ct,
            applied, clamped, mode = %self.mode, "residual decision"
        );

        let action = if applied { adjusted } else { base.clone() };
        (action, decision)
    }

    /// Shift the price limits by `delta_ct`, clamping at zero. Modes,
    /// powers and the SoC floor are never touched, which is what keeps the
    /// planner's safety envelope intact by construction.
    fn apply_delta(base: &Action, delta_ct: f64) -> (Action, bool) {
        let mut clamped = false;
        let mut shift = |limit: Option<f64>| {
            limit.map(|ct| {
                let shifted = ct + delta_ct;
                if shifted < 0.0 {
                    clamped = true;
                    0.0
                } else {
                    shifted
                }
            })
        };
        let battery_price_limit_ct = shift(base.battery_price_limit_ct);
        let ev_price_limit_ct = shift(base.ev_price_limit_ct);
        (
            Action {
                battery_price_limit_ct,
                ev_price_limit_ct,
                ..base.clone()
            },
            clamped,
        )
    }

    /// One incremental value update per replayed experience:
    /// `q += lr * (reward - q)`.
    pub fn train(&mut self, batch: &[&ReplayExperience]) {
        let len = self.deltas.len();
        for experience in batch {
            if experience.action_index >= len {
                continue;
            }
            let values = Self::values_mut(&mut self.q, experience.state, len);
            let q = values[experience.action_index];
            values[experience.action_index] = q + self.cfg.learning_rate * (experience.reward - q);
        }
    }

    /// The promotion gate: a minimum shadow window with zero recorded
    /// constraint violations.
    pub fn audit(&self, now: DateTime<Utc>) -> Result<(), PromotionError> {
        let observed_days = now.signed_duration_since(self.shadow_since).num_days();
        if observed_days < self.cfg.audit_window_days {
            return Err(PromotionError::WindowTooShort {
                observed_days,
                required_days: self.cfg.audit_window_days,
            });
        }
        if self.violation_count > 0 {
            return Err(PromotionError::ConstraintViolations {
                count: self.violation_count,
            });
        }
        Ok(())
    }

    /// Promote shadow -> advisory, gated on a passing audit.
    pub fn promote(&mut self, now: DateTime<Utc>) -> Result<(), PromotionError> {
        self.audit(now)?;
        self.mode = AgentMode::Advisory;
        Ok(())
    }

    /// Re-arm the observation window after re-tuning, clearing the
    /// violation history.
    pub fn reset_audit(&mut self, now: DateTime<Utc>) {
        self.shadow_since = now;
        self.violation_count = 0;
        self.mode = AgentMode::Shadow;
    }
}
