//! Core snapshot types shared across the decision loop.
//!
//! A `SystemState` is assembled once per cycle from hardware reads and
//! forecast refreshes, published to the `StateStore`, and treated as
//! immutable from then on. Consumers only ever receive copies.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Fixed planning-slot length.
pub const SLOT_MINUTES: i64 = 15;
/// Full planning horizon (24 h of 15-minute slots).
pub const HORIZON_SLOTS: usize = 96;
/// Shortest horizon the planner will accept.
pub const MIN_HORIZON_SLOTS: usize = 32;

/// Battery state as read from the inverter gateway at cycle start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub soc_percent: f64,
    /// Positive = charging, negative = discharging.
    pub power_w: f64,
    pub capacity_kwh: f64,
    pub max_charge_w: f64,
    pub max_discharge_w: f64,
}

/// Connected-vehicle state. Absent when no vehicle is plugged in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvSnapshot {
    pub soc_percent: f64,
    pub capacity_kwh: f64,
    pub max_charge_w: f64,
    pub target_soc_percent: f64,
    /// Next known departure, if the vehicle announced one.
    pub departure: Option<DateTime<Utc>>,
}

impl EvSnapshot {
    /// Slot index of the departure within a horizon starting at `horizon_start`.
    pub fn departure_slot(&self, horizon_start: DateTime<Utc>) -> Option<usize> {
        let departure = self.departure?;
        let minutes = departure.signed_duration_since(horizon_start).num_minutes();
        if minutes <= 0 {
            return None;
        }
        Some((minutes / SLOT_MINUTES) as usize)
    }
}

/// Grid price now plus the forecast series the planner runs over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub current_ct_kwh: f64,
    /// One entry per 15-minute slot, at most [`HORIZON_SLOTS`].
    pub forecast_ct_kwh: Vec<f64>,
    pub stats: PriceStats,
}

/// Percentiles and relative spread of the price forecast.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PriceStats {
    pub p10: f64,
    pub p30: f64,
    pub p50: f64,
    pub p70: f64,
    pub p90: f64,
    /// (p90 - p10) / p90, in [0, 1].
    pub spread: f64,
}

impl PriceStats {
    /// Compute stats over a forecast series. Returns `None` for an empty series.
    pub fn from_series(series: &[f64]) -> Option<Self> {
        if series.is_empty() {
            return None;
        }
        let sorted: Vec<f64> = series
            .iter()
            .copied()
            .sorted_by_key(|p| OrderedFloat(*p))
            .collect();
        let pick = |q: f64| {
            let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
            sorted[idx]
        };
        let (p10, p30, p50, p70, p90) = (pick(0.1), pick(0.3), pick(0.5), pick(0.7), pick(0.9));
        let spread = if p90.abs() > f64::EPSILON {
            ((p90 - p10) / p90).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(Self {
            p10,
            p30,
            p50,
            p70,
            p90,
            spread,
        })
    }
}

/// PV output now plus the 96-slot forecast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvSnapshot {
    pub power_w: f64,
    pub forecast_w: Vec<f64>,
    /// Raw forecaster confidence in [0, 1], before reliability scaling.
    pub confidence: f64,
}

impl PvSnapshot {
    /// Forecast PV energy over the next `slots` slots, in kWh.
    pub fn forecast_sum_kwh(&self, slots: usize) -> f64 {
        let dt_h = SLOT_MINUTES as f64 / 60.0;
        self.forecast_w
            .iter()
            .take(slots)
            .map(|w| w / 1000.0 * dt_h)
            .sum()
    }
}

/// House load now plus the 96-slot forecast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub power_w: f64,
    pub forecast_w: Vec<f64>,
    pub confidence: f64,
}

/// Immutable per-cycle snapshot of everything the decision core reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    pub captured_at: DateTime<Utc>,
    pub battery: BatterySnapshot,
    pub ev: Option<EvSnapshot>,
    pub price: PriceSnapshot,
    pub pv: PvSnapshot,
    pub load: LoadSnapshot,
}

impl SystemState {
    /// Number of slots for which price data actually exists.
    pub fn horizon_len(&self) -> usize {
        self.price.forecast_ct_kwh.len().min(HORIZON_SLOTS)
    }
}
