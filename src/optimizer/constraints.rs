use serde::{Deserialize, Serialize};

use crate::config::{BatteryConfig, EvConfig, PlannerConfig};

/// Physical and economic constraints of one solve.
///
/// `floor_soc_percent` is the *effective* floor: the maximum of the
/// configured static minimum and the dynamic buffer output for this cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConstraints {
    pub floor_soc_percent: f64,
    pub max_soc_percent: f64,
    pub battery_capacity_kwh: f64,
    pub battery_max_charge_kw: f64,
    pub battery_max_discharge_kw: f64,
    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,
    pub ev_capacity_kwh: f64,
    pub ev_max_charge_kw: f64,
    pub ev_charge_efficiency: f64,
    pub ev_target_soc_percent: f64,
    pub grid_limit_kw: f64,
    pub feed_in_ct_kwh: f64,
    pub departure_penalty_ct_per_percent: f64,
    pub solver_budget_secs: u64,
}

impl PlannerConstraints {
    pub fn from_config(battery: &BatteryConfig, ev: &EvConfig, planner: &PlannerConfig) -> Self {
        Self {
            floor_soc_percent: battery.min_soc_percent,
            max_soc_percent: battery.max_soc_percent,
            battery_capacity_kwh: battery.capacity_kwh,
            battery_max_charge_kw: battery.max_charge_kw,
            battery_max_discharge_kw: battery.max_discharge_kw,
            charge_efficiency: battery.charge_efficiency,
            discharge_efficiency: battery.discharge_efficiency,
            ev_capacity_kwh: ev.capacity_kwh,
            ev_max_charge_kw: ev.max_charge_kw,
            ev_charge_efficiency: ev.charge_efficiency,
            ev_target_soc_percent: ev.target_soc_percent,
            grid_limit_kw: planner.grid_limit_kw,
            feed_in_ct_kwh: planner.feed_in_ct_kwh,
            departure_penalty_ct_per_percent: planner.departure_penalty_ct_per_percent,
            solver_budget_secs: planner.solver_budget_secs,
        }
    }

    /// Raise the floor to the dynamic buffer output. The effective floor is
    /// never lowered below the configured minimum.
    pub fn with_effective_floor(mut self, buffer_floor_percent: f64) -> Self {
        self.floor_soc_percent = self.floor_soc_percent.max(buffer_floor_percent);
        self
    }

    pub fn solver_budget(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.solver_budget_secs)
    }
}

impl Default for PlannerConstraints {
    fn default() -> Self {
        Self::from_config(
            &BatteryConfig::default(),
            &EvConfig::default(),
            &PlannerConfig::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_floor_takes_maximum() {
        let constraints = PlannerConstraints::default();
        let configured = constraints.floor_soc_percent;

        let raised = constraints.clone().with_effective_floor(configured + 15.0);
        assert_eq!(raised.floor_soc_percent, configured + 15.0);

        let not_lowered = constraints.with_effective_floor(configured - 15.0);
        assert_eq!(not_lowered.floor_soc_percent, configured);
    }
}
