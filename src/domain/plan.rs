//! Plan horizon produced by the planner each cycle.
//!
//! A plan is recomputed from scratch every cycle and never mutated. Only
//! slot 0 is ever acted upon; the remaining slots exist for inspection and
//! for the departure/floor bookkeeping of the current solve.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::SLOT_MINUTES;

/// One 15-minute interval of the dispatch plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSlot {
    pub start: DateTime<Utc>,
    /// Battery charge power for the slot, >= 0.
    pub battery_charge_w: f64,
    /// Battery discharge power for the slot, >= 0.
    pub battery_discharge_w: f64,
    /// EV charge power for the slot, >= 0 (0 when no vehicle connected).
    pub ev_charge_w: f64,
    pub grid_price_ct_kwh: f64,
    pub pv_forecast_w: f64,
    pub load_forecast_w: f64,
    /// Battery SoC at slot start, as solved.
    pub battery_soc_percent: f64,
    /// EV SoC at slot start, when a vehicle is connected.
    pub ev_soc_percent: Option<f64>,
}

/// How the plan was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolverStatus {
    /// LP solved to optimality within its budget.
    Optimal,
    /// Deterministic percentile fallback produced the plan.
    Heuristic,
}

/// Full receding-horizon plan for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanHorizon {
    pub id: Uuid,
    pub computed_at: DateTime<Utc>,
    pub status: SolverStatus,
    /// Ordered dispatch slots, one per 15-minute interval.
    pub slots: Vec<DispatchSlot>,
    /// Objective value of the solve, in cents.
    pub objective_cost_ct: f64,
    /// SoC percentage points by which the departure target is missed, when
    /// the LP could not reach it with available power. `None` when met.
    pub departure_shortfall_percent: Option<f64>,
    /// Effective SoC floor the solve was constrained to.
    pub soc_floor_percent: f64,
}

impl PlanHorizon {
    /// The only slot the controller ever executes.
    pub fn first_slot(&self) -> Option<&DispatchSlot> {
        self.slots.first()
    }

    /// A plan older than one slot must never be executed.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.computed_at) > Duration::minutes(SLOT_MINUTES)
    }

    /// Summary persisted alongside the learned models.
    pub fn snapshot(&self) -> PlanSnapshot {
        PlanSnapshot {
            computed_at: self.computed_at,
            status: self.status,
            objective_cost_ct: self.objective_cost_ct,
        }
    }
}

/// Compact persisted record of a solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub computed_at: DateTime<Utc>,
    pub status: SolverStatus,
    pub objective_cost_ct: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_at(computed_at: DateTime<Utc>) -> PlanHorizon {
        PlanHorizon {
            id: Uuid::new_v4(),
            computed_at,
            status: SolverStatus::Optimal,
            slots: vec![],
            objective_cost_ct: 0.0,
            departure_shortfall_percent: None,
            soc_floor_percent: 20.0,
        }
    }

    #[test]
    fn fresh_plan_is_not_stale() {
        let now = Utc::now();
        assert!(!plan_at(now).is_stale(now + Duration::minutes(5)));
    }

    #[test]
    fn plan_past_one_slot_is_stale() {
        let now = Utc::now();
        assert!(plan_at(now).is_stale(now + Duration::minutes(16)));
    }
}
