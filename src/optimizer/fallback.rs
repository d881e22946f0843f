//! Deterministic percentile-threshold fallback.
//!
//! The always-succeeding backstop used whenever the LP fails (timeout,
//! degenerate inputs, solver error). Accepts the same `SystemState` and
//! returns the same `Action` shape as the planner path, so the rest of the
//! cycle cannot tell which optimizer produced the decision.

use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    Action, ActionSource, BatteryMode, DispatchSlot, EvMode, PlanHorizon, SolverStatus,
    SystemState, SLOT_MINUTES,
};
use crate::optimizer::PlannerConstraints;

/// Greedy price-percentile optimizer: charge below the charge percentile,
/// discharge above the discharge percentile, hold in between.
pub struct PercentileOptimizer {
    /// SoC margin above the floor required before discharging.
    pub discharge_margin_percent: f64,
    /// Headroom factor applied to the departure urgency estimate.
    pub urgency_factor: f64,
}

impl Default for PercentileOptimizer {
    fn default() -> Self {
        Self {
            discharge_margin_percent: 10.0,
            urgency_factor: 1.2,
        }
    }
}

impl PercentileOptimizer {
    /// Never fails: degenerate inputs degrade to hold-everything.
    pub fn optimize(&self, state: &SystemState, constraints: &PlannerConstraints) -> Action {
        let floor = constraints.floor_soc_percent;
        if state.price.forecast_ct_kwh.is_empty() {
            return Action::hold_all(floor, ActionSource::Fallback);
        }

        let stats = state.price.stats;
        let price = state.price.current_ct_kwh;
        let soc = state.battery.soc_percent;

        let (battery_mode, battery_power_w, battery_price_limit_ct) =
            if price <= stats.p30 && soc < constraints.max_soc_percent {
                (
                    BatteryMode::Charge,
                    state.battery.max_charge_w,
                    Some(stats.p30),
                )
            } else if price >= stats.p70 && soc > floor + self.discharge_margin_percent {
                (
                    BatteryMode::Discharge,
                    state.battery.max_discharge_w,
                    Some(stats.p70),
                )
            } else {
                (BatteryMode::Hold, 0.0, None)
            };

        let (ev_mode, ev_power_w, ev_price_limit_ct) = match &state.ev {
            None => (EvMode::Idle, 0.0, None),
            Some(ev) if ev.soc_percent >= ev.target_soc_percent => (EvMode::Idle, 0.0, None),
            Some(ev) => {
                if self.departure_urgent(state, ev.departure_slot(state.captured_at)) {
                    // Not enough slack to wait for cheap slots: charge now,
                    // no price limit.
                    (EvMode::Charge, ev.max_charge_w, None)
                } else if price <= stats.p30 {
                    (EvMode::Charge, ev.max_charge_w, Some(stats.p30))
                } else {
                    (EvMode::Idle, 0.0, None)
                }
            }
        };

        debug!(
            battery_mode = %battery_mode,
            ev_mode = %ev_mode,
            price_ct_kwh = price,
            "fallback decision"
        );

        Action {
            battery_mode,
            battery_power_w,
            battery_price_limit_ct,
            ev_mode,
            ev_power_w,
            ev_price_limit_ct,
            soc_floor_percent: floor,
            source: ActionSource::Fallback,
        }
    }

    fn departure_urgent(&self, state: &SystemState, departure_slot: Option<usize>) -> bool {
        let Some(ev) = &state.ev else { return false };
        let Some(slots_left) = departure_slot else {
            return false;
        };
        let missing_kwh =
            (ev.target_soc_percent - ev.soc_percent).max(0.0) / 100.0 * ev.capacity_kwh;
        if missing_kwh <= 0.0 {
            return false;
        }
        let charge_kw = ev.max_charge_w / 1000.0;
        if charge_kw <= 0.0 {
            return true;
        }
        let slots_needed = missing_kwh / charge_kw / (SLOT_MINUTES as f64 / 60.0);
        slots_needed * self.urgency_factor >= slots_left as f64
    }

    /// Single-slot heuristic plan mirroring the action, so the dashboard
    /// always has a plan to show even when the LP failed.
    pub fn as_plan(
        &self,
        state: &SystemState,
        constraints: &PlannerConstraints,
        action: &Action,
    ) -> PlanHorizon {
        let (charge_w, discharge_w) = match action.battery_mode {
            BatteryMode::Charge => (action.battery_power_w, 0.0),
            BatteryMode::Discharge => (0.0, action.battery_power_w),
            BatteryMode::Hold => (0.0, 0.0),
        };
        let slot = DispatchSlot {
            start: state.captured_at,
            battery_charge_w: charge_w,
            battery_discharge_w: discharge_w,
            ev_charge_w: match action.ev_mode {
                EvMode::Charge => action.ev_power_w,
                EvMode::Idle => 0.0,
            },
            grid_price_ct_kwh: state.price.current_ct_kwh,
            pv_forecast_w: state.pv.forecast_w.first().copied().unwrap_or(0.0),
            load_forecast_w: state.load.forecast_w.first().copied().unwrap_or(0.0),
            battery_soc_percent: state.battery.soc_percent,
            ev_soc_percent: state.ev.as_ref().map(|e| e.soc_percent),
        };
        let dt_h = SLOT_MINUTES as f64 / 60.0;
        let net_kw = (slot.load_forecast_w - slot.pv_forecast_w + slot.battery_charge_w
            + slot.ev_charge_w
            - slot.battery_discharge_w)
            / 1000.0;
        let objective_cost_ct = if net_kw >= 0.0 {
            slot.grid_price_ct_kwh * net_kw * dt_h
        } else {
            constraints.feed_in_ct_kwh * net_kw * dt_h
        };

        PlanHorizon {
            id: Uuid::new_v4(),
            computed_at: state.captured_at,
            status: SolverStatus::Heuristic,
            slots: vec![slot],
            objective_cost_ct,
            departure_shortfall_percent: None,
            soc_floor_percent: constraints.floor_soc_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BatterySnapshot, EvSnapshot, LoadSnapshot, PriceSnapshot, PriceStats, PvSnapshot,
    };
    use chrono::{Duration as ChronoDuration, Utc};

    fn state_with_price(current: f64) -> SystemState {
        let forecast: Vec<f64> = (0..96).map(|t| 10.0 + (t % 48) as f64).collect();
        SystemState {
            captured_at: Utc::now(),
            battery: BatterySnapshot {
                soc_percent: 50.0,
                power_w: 0.0,
                capacity_kwh: 10.0,
                max_charge_w: 5000.0,
                max_discharge_w: 5000.0,
            },
            ev: None,
            price: PriceSnapshot {
                current_ct_kwh: current,
                stats: PriceStats::from_series(&forecast).unwrap(),
                forecast_ct_kwh: forecast,
            },
            pv: PvSnapshot {
                power_w: 0.0,
                forecast_w: vec![0.0; 96],
                confidence: 0.5,
            },
            load: LoadSnapshot {
                power_w: 600.0,
                forecast_w: vec![600.0; 96],
                confidence: 0.9,
            },
        }
    }

    #[test]
    fn cheap_price_charges_battery() {
        let action = PercentileOptimizer::default()
            .optimize(&state_with_price(11.0), &PlannerConstraints::default());
        assert_eq!(action.battery_mode, BatteryMode::Charge);
        assert!(action.battery_price_limit_ct.is_some());
        assert_eq!(action.source, ActionSource::Fallback);
    }

    #[test]
    fn expensive_price_discharges_battery() {
        let action = PercentileOptimizer::default()
            .optimize(&state_with_price(55.0), &PlannerConstraints::default());
        assert_eq!(action.battery_mode, BatteryMode::Discharge);
    }

    #[test]
    fn mid_price_holds() {
        let action = PercentileOptimizer::default()
            .optimize(&state_with_price(33.0), &PlannerConstraints::default());
        assert_eq!(action.battery_mode, BatteryMode::Hold);
        assert_eq!(action.battery_power_w, 0.0);
    }

    #[test]
    fn soc_at_floor_never_discharges() {
        let mut state = state_with_price(55.0);
        state.battery.soc_percent = 22.0;
        let action =
            PercentileOptimizer::default().optimize(&state, &PlannerConstraints::default());
        assert_ne!(action.battery_mode, BatteryMode::Discharge);
    }

    #[test]
    fn empty_forecast_degrades_to_hold_all() {
        let mut state = state_with_price(30.0);
        state.price.forecast_ct_kwh.clear();
        let action =
            PercentileOptimizer::default().optimize(&state, &PlannerConstraints::default());
        assert_eq!(action, Action::hold_all(20.0, ActionSource::Fallback));
    }

    #[test]
    fn imminent_departure_charges_ev_without_price_limit() {
        let mut state = state_with_price(55.0);
        state.ev = Some(EvSnapshot {
            soc_percent: 30.0,
            capacity_kwh: 60.0,
            max_charge_w: 11_000.0,
            target_soc_percent: 80.0,
            departure: Some(state.captured_at + ChronoDuration::minutes(60)),
        });
        let action =
            PercentileOptimizer::default().optimize(&state, &PlannerConstraints::default());
        assert_eq!(action.ev_mode, EvMode::Charge);
        assert!(action.ev_price_limit_ct.is_none());
    }

    #[test]
    fn ev_at_target_stays_idle() {
        let mut state = state_with_price(11.0);
        state.ev = Some(EvSnapshot {
            soc_percent: 85.0,
            capacity_kwh: 60.0,
            max_charge_w: 11_000.0,
            target_soc_percent: 80.0,
            departure: None,
        });
        let action =
            PercentileOptimizer::default().optimize(&state, &PlannerConstraints::default());
        assert_eq!(action.ev_mode, EvMode::Idle);
    }

    #[test]
    fn heuristic_plan_mirrors_action() {
        let optimizer = PercentileOptimizer::default();
        let state = state_with_price(11.0);
        let constraints = PlannerConstraints::default();
        let action = optimizer.optimize(&state, &constraints);
        let plan = optimizer.as_plan(&state, &constraints, &action);

        assert_eq!(plan.status, SolverStatus::Heuristic);
        assert_eq!(plan.slots.len(), 1);
        assert_eq!(plan.slots[0].battery_charge_w, action.battery_power_w);
        assert_eq!(plan.soc_floor_percent, action.soc_floor_percent);
    }
}
