//! Rolling-horizon linear-programming planner.
//!
//! Solves, every cycle, a continuous LP over the full forecast horizon
//! (32..=96 slots of 15 minutes) that jointly decides battery charge and
//! discharge power and EV charge power per slot, minimizing grid cost net
//! of feed-in revenue. Battery charge and discharge are separate
//! non-negative variables; with round-trip efficiency below 1.0 a slot
//! that both charges and discharges is strictly sub-optimal, so no integer
//! variables are needed. `soc[0]` is pinned to the measured SoC each cycle,
//! which is what makes the scheme a receding-horizon controller instead of
//! a single fixed forecast.
//!
//! The planner is a pure function of (state, constraints, reliability);
//! all statefulness lives in the `StateStore`.

use chrono::Duration as ChronoDuration;
use good_lp::{
    constraint, default_solver, variable, Expression, ProblemVariables, Solution, SolverModel,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    DispatchSlot, PlanHorizon, SolverStatus, SystemState, MIN_HORIZON_SLOTS, SLOT_MINUTES,
};
use crate::optimizer::PlannerConstraints;

/// Hours per slot.
const DT_H: f64 = SLOT_MINUTES as f64 / 60.0;
/// Below this power the solver output is treated as numerical noise.
const POWER_EPS_KW: f64 = 1e-4;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("price forecast too short: {slots} slots, need at least {min}")]
    HorizonTooShort { slots: usize, min: usize },
    #[error("solver exceeded its {budget_secs}s wall-clock budget")]
    Timeout { budget_secs: u64 },
    #[error("solver failed: {0}")]
    Solver(String),
}

pub struct HorizonPlanner;

impl HorizonPlanner {
    /// Solve one cycle. `pv_reliability` scales down the PV forecast before
    /// it enters the model, so an unreliable forecaster cannot talk the
    /// plan into counting on surplus that will not arrive.
    pub async fn plan(
        &self,
        state: &SystemState,
        constraints: &PlannerConstraints,
        pv_reliability: f64,
    ) -> Result<PlanHorizon, PlanError> {
        let slots = state.horizon_len();
        if slots < MIN_HORIZON_SLOTS {
            return Err(PlanError::HorizonTooShort {
                slots,
                min: MIN_HORIZON_SLOTS,
            });
        }

        let budget = constraints.solver_budget();
        let state = state.clone();
        let constraints = constraints.clone();

        let solve = tokio::task::spawn_blocking(move || {
            solve_lp(&state, &constraints, pv_reliability.clamp(0.0, 1.0))
        });

        match tokio::time::timeout(budget, solve).await {
            Err(_) => Err(PlanError::Timeout {
                budget_secs: budget.as_secs(),
            }),
            Ok(Err(join)) => Err(PlanError::Solver(join.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn solve_lp(
    state: &SystemState,
    constraints: &PlannerConstraints,
    pv_reliability: f64,
) -> Result<PlanHorizon, PlanError> {
    let n = state.horizon_len();
    let prices = &state.price.forecast_ct_kwh[..n];

    // Forecast series in kW, padded with their last value when shorter
    // than the price horizon.
    let series_kw = |forecast: &[f64]| -> Vec<f64> {
        let last = forecast.last().copied().unwrap_or(0.0) / 1000.0;
        (0..n)
            .map(|t| forecast.get(t).map_or(last, |w| w / 1000.0))
            .collect()
    };
    let pv_kw: Vec<f64> = series_kw(&state.pv.forecast_w)
        .into_iter()
        .map(|kw| kw * pv_reliability)
        .collect();
    let load_kw = series_kw(&state.load.forecast_w);

    let ev = state.ev.as_ref();
    let ev_max_kw = ev.map_or(0.0, |e| (e.max_charge_w / 1000.0).min(constraints.ev_max_charge_kw));
    let departure_slot = ev
        .and_then(|e| e.departure_slot(state.captured_at))
        .map(|idx| idx.min(n));

    let mut problem = ProblemVariables::new();
    let charge = problem.add_vector(variable().min(0.0).max(constraints.battery_max_charge_kw), n);
    let discharge = problem.add_vector(
        variable().min(0.0).max(constraints.battery_max_discharge_kw),
        n,
    );
    // EV power is clamped to [0, 0] for every slot when no vehicle is
    // connected, which keeps the model shape identical either way.
    let ev_charge = problem.add_vector(variable().min(0.0).max(ev_max_kw), n);
    let grid_import = problem.add_vector(variable().min(0.0), n);
    let grid_export = problem.add_vector(variable().min(0.0), n);
    let soc = problem.add_vector(variable().min(0.0).max(100.0), n + 1);
    let ev_soc = problem.add_vector(variable().min(0.0).max(100.0), n + 1);
    let shortfall = problem.add(variable().min(0.0).max(100.0));

    let energy_cost = (0..n)
        .map(|t| DT_H * (prices[t] * grid_import[t] - constraints.feed_in_ct_kwh * grid_export[t]))
        .sum::<Expression>();
    let objective = energy_cost + constraints.departure_penalty_ct_per_percent * shortfall;

    let mut model = problem.minimise(objective).using(default_solver);

    // Re-anchor to the measured state every cycle.
    let measured_soc = state.battery.soc_percent;
    let measured_ev_soc = ev.map_or(0.0, |e| e.soc_percent);
    model = model.with(constraint!(soc[0] == measured_soc));
    model = model.with(constraint!(ev_soc[0] == measured_ev_soc));

    let soc_per_kwh = 100.0 / constraints.battery_capacity_kwh;
    let ev_soc_per_kwh = 100.0 / constraints.ev_capacity_kwh.max(f64::EPSILON);

    for t in 0..n {
        // Power balance: import - export = load - pv + charging - discharge.
        let net = load_kw[t] - pv_kw[t] + charge[t] + ev_charge[t] - discharge[t];
        model = model.with(constraint!(grid_import[t] - grid_export[t] == net));

        // Fuse limit on import, with the uncontrollable net house load
        // already subtracted from the available headroom.
        let headroom = (constraints.grid_limit_kw - (load_kw[t] - pv_kw[t]).max(0.0)).max(0.0);
        model = model.with(constraint!(charge[t] + ev_charge[t] <= headroom));

        // SoC dynamics with asymmetric efficiency.
        let soc_delta = (charge[t] * constraints.charge_efficiency
            - discharge[t] / constraints.discharge_efficiency)
            * DT_H
            * soc_per_kwh;
        model = model.with(constraint!(soc[t + 1] == soc[t] + soc_delta));
        model = model.with(constraint!(soc[t + 1] >= constraints.floor_soc_percent));
        model = model.with(constraint!(soc[t + 1] <= constraints.max_soc_percent));

        let ev_delta = ev_charge[t] * constraints.ev_charge_efficiency * DT_H * ev_soc_per_kwh;
        model = model.with(constraint!(ev_soc[t + 1] == ev_soc[t] + ev_delta));
    }

    // Departure as an inequality with an explicit shortfall slack: when the
    // target is unreachable the problem stays feasible and the plan simply
    // falls short, with the miss reported on the result.
    if let (Some(dep), Some(ev)) = (departure_slot, ev) {
        let target = ev.target_soc_percent.max(constraints.ev_target_soc_percent);
        model = model.with(constraint!(ev_soc[dep] + shortfall >= target));
    }

    let solution = model
        .solve()
        .map_err(|e| PlanError::Solver(e.to_string()))?;

    let mut slots = Vec::with_capacity(n);
    let mut objective_cost_ct = 0.0;
    for t in 0..n {
        let start = state.captured_at + ChronoDuration::minutes(t as i64 * SLOT_MINUTES);
        let charge_kw = zeroed(solution.value(charge[t]));
        let discharge_kw = zeroed(solution.value(discharge[t]));
        let ev_kw = zeroed(solution.value(ev_charge[t]));
        objective_cost_ct += DT_H
            * (prices[t] * zeroed(solution.value(grid_import[t]))
                - constraints.feed_in_ct_kwh * zeroed(solution.value(grid_export[t])));

        slots.push(DispatchSlot {
            start,
            battery_charge_w: charge_kw * 1000.0,
            battery_discharge_w: discharge_kw * 1000.0,
            ev_charge_w: ev_kw * 1000.0,
            grid_price_ct_kwh: prices[t],
            pv_forecast_w: pv_kw[t] * 1000.0,
            load_forecast_w: load_kw[t] * 1000.0,
            battery_soc_percent: solution.value(soc[t]),
            ev_soc_percent: ev.map(|_| solution.value(ev_soc[t])),
        });
    }

    let shortfall_percent = solution.value(shortfall);
    let departure_shortfall_percent = (departure_slot.is_some() && shortfall_percent > 0.01)
        .then_some(shortfall_percent);

    debug!(
        slots = n,
        objective_cost_ct,
        shortfall = ?departure_shortfall_percent,
        "horizon solve complete"
    );

    Ok(PlanHorizon {
        id: Uuid::new_v4(),
        computed_at: state.captured_at,
        status: SolverStatus::Optimal,
        slots,
        objective_cost_ct,
        departure_shortfall_percent,
        soc_floor_percent: constraints.floor_soc_percent,
    })
}

fn zeroed(kw: f64) -> f64 {
    if kw.abs() < POWER_EPS_KW {
        0.0
    } else {
        kw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BatterySnapshot, EvSnapshot, LoadSnapshot, PriceSnapshot, PriceStats, PvSnapshot,
    };
    use chrono::Utc;

    fn cheap_night_state(soc: f64) -> SystemState {
        // Slots 0..32 cheap (night), 32..96 expensive (day).
        let forecast: Vec<f64> = (0..96)
            .map(|t| if t < 32 { 12.0 } else { 38.0 })
            .collect();
        SystemState {
            captured_at: Utc::now(),
            battery: BatterySnapshot {
                soc_percent: soc,
                power_w: 0.0,
                capacity_kwh: 10.0,
                max_charge_w: 5000.0,
                max_discharge_w: 5000.0,
            },
            ev: None,
            price: PriceSnapshot {
                current_ct_kwh: forecast[0],
                stats: PriceStats::from_series(&forecast).unwrap(),
                forecast_ct_kwh: forecast,
            },
            pv: PvSnapshot {
                power_w: 0.0,
                forecast_w: vec![0.0; 96],
                confidence: 0.5,
            },
            load: LoadSnapshot {
                power_w: 800.0,
                forecast_w: vec![800.0; 96],
                confidence: 0.9,
            },
        }
    }

    fn with_ev(mut state: SystemState, soc: f64, departure_slots: i64) -> SystemState {
        state.ev = Some(EvSnapshot {
            soc_percent: soc,
            capacity_kwh: 60.0,
            max_charge_w: 11_000.0,
            target_soc_percent: 80.0,
            departure: Some(
                state.captured_at + ChronoDuration::minutes(departure_slots * SLOT_MINUTES),
            ),
        });
        state
    }

    #[tokio::test]
    async fn soc_zero_is_anchored_to_measured_state() {
        let state = cheap_night_state(47.0);
        let plan = HorizonPlanner
            .plan(&state, &PlannerConstraints::default(), 1.0)
            .await
            .unwrap();
        assert!((plan.slots[0].battery_soc_percent - 47.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn no_slot_charges_and_discharges_simultaneously() {
        let state = cheap_night_state(50.0);
        let plan = HorizonPlanner
            .plan(&state, &PlannerConstraints::default(), 1.0)
            .await
            .unwrap();
        for slot in &plan.slots {
            assert!(
                !(slot.battery_charge_w > 0.0 && slot.battery_discharge_w > 0.0),
                "slot at {} both charges ({} W) and discharges ({} W)",
                slot.start,
                slot.battery_charge_w,
                slot.battery_discharge_w
            );
        }
    }

    #[tokio::test]
    async fn charges_cheap_slots_discharges_expensive_slots() {
        let state = cheap_night_state(40.0);
        let plan = HorizonPlanner
            .plan(&state, &PlannerConstraints::default(), 1.0)
            .await
            .unwrap();

        let night_charge: f64 = plan.slots[..32].iter().map(|s| s.battery_charge_w).sum();
        let day_discharge: f64 = plan.slots[32..].iter().map(|s| s.battery_discharge_w).sum();
        assert!(night_charge > 0.0, "expected charging in the cheap window");
        assert!(
            day_discharge > 0.0,
            "expected discharging in the expensive window"
        );
    }

    #[tokio::test]
    async fn soc_respects_effective_floor() {
        let state = cheap_night_state(50.0);
        let constraints = PlannerConstraints::default().with_effective_floor(35.0);
        let plan = HorizonPlanner.plan(&state, &constraints, 1.0).await.unwrap();
        for slot in plan.slots.iter().skip(1) {
            assert!(
                slot.battery_soc_percent >= 35.0 - 1e-6,
                "soc {} below floor",
                slot.battery_soc_percent
            );
        }
        assert_eq!(plan.soc_floor_percent, 35.0);
    }

    #[tokio::test]
    async fn unreachable_departure_reports_shortfall_instead_of_failing() {
        // 2 slots to departure, 30 kWh missing, 11 kW charger: impossible.
        let state = with_ev(cheap_night_state(50.0), 30.0, 2);
        let plan = HorizonPlanner
            .plan(&state, &PlannerConstraints::default(), 1.0)
            .await
            .unwrap();
        let shortfall = plan.departure_shortfall_percent.expect("shortfall expected");
        assert!(shortfall > 10.0, "shortfall {shortfall} too small");
    }

    #[tokio::test]
    async fn reachable_departure_has_no_shortfall() {
        // Plenty of time: 90 slots to charge 30 SoC points.
        let state = with_ev(cheap_night_state(50.0), 50.0, 90);
        let plan = HorizonPlanner
            .plan(&state, &PlannerConstraints::default(), 1.0)
            .await
            .unwrap();
        assert!(plan.departure_shortfall_percent.is_none());
    }

    #[tokio::test]
    async fn no_vehicle_means_zero_ev_power_everywhere() {
        let state = cheap_night_state(50.0);
        let plan = HorizonPlanner
            .plan(&state, &PlannerConstraints::default(), 1.0)
            .await
            .unwrap();
        assert!(plan.slots.iter().all(|s| s.ev_charge_w == 0.0));
        assert!(plan.slots.iter().all(|s| s.ev_soc_percent.is_none()));
    }

    #[tokio::test]
    async fn short_price_horizon_is_rejected() {
        let mut state = cheap_night_state(50.0);
        state.price.forecast_ct_kwh.truncate(12);
        let result = HorizonPlanner
            .plan(&state, &PlannerConstraints::default(), 1.0)
            .await;
        assert!(matches!(
            result,
            Err(PlanError::HorizonTooShort { slots: 12, .. })
        ));
    }

    #[tokio::test]
    async fn zero_budget_times_out() {
        let state = cheap_night_state(50.0);
        let mut constraints = PlannerConstraints::default();
        constraints.solver_budget_secs = 0;
        let result = HorizonPlanner.plan(&state, &constraints, 1.0).await;
        assert!(matches!(result, Err(PlanError::Timeout { .. })));
    }

    #[tokio::test]
    async fn unreliable_pv_shrinks_planned_surplus() {
        let mut state = cheap_night_state(50.0);
        state.pv.forecast_w = vec![4000.0; 96];
        let constraints = PlannerConstraints::default();

        let trusted = HorizonPlanner.plan(&state, &constraints, 1.0).await.unwrap();
        let distrusted = HorizonPlanner.plan(&state, &constraints, 0.2).await.unwrap();
        let sum = |p: &PlanHorizon| p.slots.iter().map(|s| s.pv_forecast_w).sum::<f64>();
        assert!(sum(&distrusted) < sum(&trusted));
    }
}
