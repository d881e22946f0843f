//! Hardware control path boundary.
//!
//! The inverter gateway and the EVSE sit behind this trait; the decision
//! core never talks to a network client directly. The simulated
//! implementation closes the loop for development and tests and doubles as
//! the call counter the observation-mode guarantees are verified against.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{BatteryConfig, EvConfig};
use crate::domain::{Action, BatteryMode, BatterySnapshot, EvMode, EvSnapshot, SLOT_MINUTES};

/// Instantaneous meter readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeterReading {
    pub pv_power_w: f64,
    pub load_power_w: f64,
}

#[async_trait]
pub trait HardwareControl: Send + Sync {
    async fn read_battery(&self) -> Result<BatterySnapshot>;
    async fn read_ev(&self) -> Result<Option<EvSnapshot>>;
    async fn read_meter(&self) -> Result<MeterReading>;
    /// Issue battery/EV charge-mode and price-limit commands.
    async fn apply(&self, action: &Action) -> Result<()>;
    /// Push a new minimum-SoC floor to the inverter.
    async fn set_min_soc(&self, percent: f64) -> Result<()>;
    /// Single-writer flag set by the battery-to-EV arbitrage sequencer;
    /// the buffer calculator skips its cycle while this is up.
    fn is_bat_to_ev_arbitrage_active(&self) -> bool;
}

#[derive(Debug)]
struct SimInner {
    battery: BatterySnapshot,
    ev: Option<EvSnapshot>,
    meter: MeterReading,
    last_action: Option<Action>,
    applied_actions: u64,
    min_soc_calls: Vec<f64>,
    arbitrage_active: bool,
}

/// In-memory battery/EV/meter model.
#[derive(Debug)]
pub struct SimulatedHardware {
    inner: Mutex<SimInner>,
    charge_efficiency: f64,
    discharge_efficiency: f64,
}

impl SimulatedHardware {
    pub fn new(battery_cfg: &BatteryConfig, initial_soc_percent: f64) -> Self {
        let battery = BatterySnapshot {
            soc_percent: initial_soc_percent,
            power_w: 0.0,
            capacity_kwh: battery_cfg.capacity_kwh,
            max_charge_w: battery_cfg.max_charge_kw * 1000.0,
            max_discharge_w: battery_cfg.max_discharge_kw * 1000.0,
        };
        Self {
            inner: Mutex::new(SimInner {
                battery,
                ev: None,
                meter: MeterReading {
                    pv_power_w: 0.0,
                    load_power_w: 600.0,
                },
                last_action: None,
                applied_actions: 0,
                min_soc_calls: Vec::new(),
                arbitrage_active: false,
            }),
            charge_efficiency: battery_cfg.charge_efficiency,
            discharge_efficiency: battery_cfg.discharge_efficiency,
        }
    }

    pub fn plug_in_ev(&self, ev_cfg: &EvConfig, soc_percent: f64, departure: Option<chrono::DateTime<chrono::Utc>>) {
        self.inner.lock().ev = Some(EvSnapshot {
            soc_percent,
            capacity_kwh: ev_cfg.capacity_kwh,
            max_charge_w: ev_cfg.max_charge_kw * 1000.0,
            target_soc_percent: ev_cfg.target_soc_percent,
            departure,
        });
    }

    pub fn set_meter(&self, pv_power_w: f64, load_power_w: f64) {
        self.inner.lock().meter = MeterReading {
            pv_power_w,
            load_power_w,
        };
    }

    pub fn set_arbitrage_active(&self, active: bool) {
        self.inner.lock().arbitrage_active = active;
    }

    pub fn applied_actions(&self) -> u64 {
        self.inner.lock().applied_actions
    }

    pub fn min_soc_calls(&self) -> Vec<f64> {
        self.inner.lock().min_soc_calls.clone()
    }

    pub fn last_action(&self) -> Option<Action> {
        self.inner.lock().last_action.clone()
    }

    /// Integrate the last applied action over one slot.
    pub fn advance_slot(&self) {
        let mut inner = self.inner.lock();
        let Some(action) = inner.last_action.clone() else {
            return;
        };
        let dt_h = SLOT_MINUTES as f64 / 60.0;
        let capacity_kwh = inner.battery.capacity_kwh;
        let delta_percent = match action.battery_mode {
            BatteryMode::Charge => {
                action.battery_power_w / 1000.0 * dt_h * self.charge_efficiency / capacity_kwh
                    * 100.0
            }
            BatteryMode::Discharge => {
                -(action.battery_power_w / 1000.0 * dt_h / self.discharge_efficiency
                    / capacity_kwh
                    * 100.0)
            }
            BatteryMode::Hold => 0.0,
        };
        inner.battery.soc_percent = (inner.battery.soc_percent + delta_percent).clamp(0.0, 100.0);
        inner.battery.power_w = match action.battery_mode {
            BatteryMode::Charge => action.battery_power_w,
            BatteryMode::Discharge => -action.battery_power_w,
            BatteryMode::Hold => 0.0,
        };

        if let Some(ev) = inner.ev.as_mut() {
            if action.ev_mode == EvMode::Charge {
                let delta = action.ev_power_w / 1000.0 * dt_h / ev.capacity_kwh * 100.0;
                ev.soc_percent = (ev.soc_percent + delta).clamp(0.0, 100.0);
            }
        }
    }
}

#[async_trait]
impl HardwareControl for SimulatedHardware {
    async fn read_battery(&self) -> Result<BatterySnapshot> {
        Ok(self.inner.lock().battery.clone())
    }

    async fn read_ev(&self) -> Result<Option<EvSnapshot>> {
        Ok(self.inner.lock().ev.clone())
    }

    async fn read_meter(&self) -> Result<MeterReading> {
        Ok(self.inner.lock().meter)
    }

    async fn apply(&self, action: &Action) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.last_action = Some(action.clone());
        inner.applied_actions += 1;
        Ok(())
    }

    async fn set_min_soc(&self, percent: f64) -> Result<()> {
        self.inner.lock().min_soc_calls.push(percent);
        Ok(())
    }

    fn is_bat_to_ev_arbitrage_active(&self) -> bool {
        self.inner.lock().arbitrage_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActionSource;

    #[tokio::test]
    async fn advance_slot_integrates_charging() {
        let hardware = SimulatedHardware::new(&BatteryConfig::default(), 50.0);
        let mut action = Action::hold_all(20.0, ActionSource::Planner);
        action.battery_mode = BatteryMode::Charge;
        action.battery_power_w = 4000.0;
        hardware.apply(&action).await.unwrap();
        hardware.advance_slot();

        let battery = hardware.read_battery().await.unwrap();
        // 4 kW for 15 min at 95% efficiency into 10 kWh: +9.5%.
        assert!((battery.soc_percent - 59.5).abs() < 0.1);
        assert_eq!(hardware.applied_actions(), 1);
    }

    #[tokio::test]
    async fn min_soc_calls_are_recorded() {
        let hardware = SimulatedHardware::new(&BatteryConfig::default(), 50.0);
        hardware.set_min_soc(25.0).await.unwrap();
        hardware.set_min_soc(30.0).await.unwrap();
        assert_eq!(hardware.min_soc_calls(), vec![25.0, 30.0]);
    }

    #[tokio::test]
    async fn arbitrage_flag_round_trips() {
        let hardware = SimulatedHardware::new(&BatteryConfig::default(), 50.0);
        assert!(!hardware.is_bat_to_ev_arbitrage_active());
        hardware.set_arbitrage_active(true);
        assert!(hardware.is_bat_to_ev_arbitrage_active());
    }
}
