//! The per-cycle decision applied to hardware.

use serde::{Deserialize, Serialize};
use strum::Display;

/// Battery operating mode for the current slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BatteryMode {
    Hold,
    Charge,
    Discharge,
}

/// EV charging mode for the current slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum EvMode {
    Idle,
    Charge,
}

/// Where the action came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ActionSource {
    Planner,
    Fallback,
}

/// Final decision handed to the hardware control path each cycle.
///
/// Price limits are optional: a `Charge` mode with a limit means "charge
/// while the price stays at or below the limit", which is how the gateway
/// interprets threshold commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub battery_mode: BatteryMode,
    pub battery_power_w: f64,
    pub battery_price_limit_ct: Option<f64>,
    pub ev_mode: EvMode,
    pub ev_power_w: f64,
    pub ev_price_limit_ct: Option<f64>,
    /// SoC floor the action respects. Never below the hard floor.
    pub soc_floor_percent: f64,
    pub source: ActionSource,
}

impl Action {
    /// Safe default: hold everything, charge nothing, discharge nothing.
    pub fn hold_all(soc_floor_percent: f64, source: ActionSource) -> Self {
        Self {
            battery_mode: BatteryMode::Hold,
            battery_power_w: 0.0,
            battery_price_limit_ct: None,
            ev_mode: EvMode::Idle,
            ev_power_w: 0.0,
            ev_price_limit_ct: None,
            soc_floor_percent,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_all_is_inert() {
        let action = Action::hold_all(20.0, ActionSource::Fallback);
        assert_eq!(action.battery_mode, BatteryMode::Hold);
        assert_eq!(action.ev_mode, EvMode::Idle);
        assert_eq!(action.battery_power_w, 0.0);
        assert_eq!(action.ev_power_w, 0.0);
        assert_eq!(action.soc_floor_percent, 20.0);
    }

    #[test]
    fn modes_render_snake_case() {
        assert_eq!(BatteryMode::Discharge.to_string(), "discharge");
        assert_eq!(EvMode::Idle.to_string(), "idle");
    }
}
