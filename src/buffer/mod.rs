//! Dynamic battery-buffer calculation.
//!
//! Replaces the single static minimum-SoC constant with a situational floor
//! derived from PV-forecast confidence, price spread and time of day. The
//! formula is closed-form so every emitted value can be explained on a
//! dashboard. A new deployment starts in observation mode: the target is
//! computed and logged every cycle but the hardware control path is never
//! called until the model is promoted to live, either automatically after
//! the configured observation period or by an explicit activation request.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum::Display;
use tracing::{debug, info};

use crate::config::BufferConfig;

/// Schema version of the persisted buffer model document.
pub const BUFFER_SCHEMA_VERSION: u32 = 1;
/// Document name under the data directory.
pub const BUFFER_DOC: &str = "buffer_model";

/// Operating mode of the buffer calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum BufferMode {
    Observation,
    Live,
}

/// Inputs to one buffer evaluation. Confidence arrives already scaled by
/// the PV reliability multiplier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferInputs {
    pub confidence: f64,
    pub price_spread: f64,
    pub hour: u32,
    pub pv_next_6h_kwh: f64,
}

impl BufferInputs {
    pub fn at(now: DateTime<Utc>, confidence: f64, price_spread: f64, pv_next_6h_kwh: f64) -> Self {
        Self {
            confidence,
            price_spread,
            hour: now.hour(),
            pv_next_6h_kwh,
        }
    }
}

/// One event-log entry, recorded every cycle the calculator runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEvent {
    pub at: DateTime<Utc>,
    pub inputs: BufferInputs,
    pub old_percent: f64,
    pub new_percent: f64,
    pub reason: String,
    /// Whether the value was pushed to hardware (always false in
    /// observation mode).
    pub applied: bool,
}

/// Persisted buffer model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferModel {
    /// When observation mode was first entered. Survives restarts.
    pub deployed_at: DateTime<Utc>,
    /// Days added to the observation period by explicit extension requests.
    pub extra_observation_days: i64,
    /// Explicit "activate now" override.
    pub live_override: bool,
    /// The floor currently applied to hardware.
    pub current_percent: f64,
    pub events: VecDeque<BufferEvent>,
}

/// Outcome of one evaluation.
#[derive(Debug, Clone)]
pub struct BufferDecision {
    pub target_percent: f64,
    pub mode: BufferMode,
    /// `Some(value)` only in live mode and only when the target differs
    /// from the currently-applied value; the hardware path must then be
    /// called exactly once with this value.
    pub apply: Option<f64>,
}

/// Read-only view for the dashboard/API layer.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub mode: BufferMode,
    pub current_percent: f64,
    pub deployed_at: DateTime<Utc>,
    pub live_override: bool,
    pub last_event: Option<BufferEvent>,
}

pub struct DynamicBufferCalc {
    cfg: BufferConfig,
    model: BufferModel,
}

impl DynamicBufferCalc {
    /// Fresh deployment: enters observation mode now.
    pub fn new(cfg: BufferConfig, now: DateTime<Utc>) -> Self {
        let model = BufferModel {
            deployed_at: now,
            extra_observation_days: 0,
            live_override: false,
            current_percent: cfg.base_percent,
            events: VecDeque::new(),
        };
        info!(deployed_at = %now, "buffer calculator entering observation mode");
        Self { cfg, model }
    }

    /// Resume from a persisted model.
    pub fn from_model(cfg: BufferConfig, model: BufferModel) -> Self {
        Self { cfg, model }
    }

    pub fn model(&self) -> &BufferModel {
        &self.model
    }

    pub fn status(&self, now: DateTime<Utc>) -> BufferStatus {
        BufferStatus {
            mode: self.mode(now),
            current_percent: self.model.current_percent,
            deployed_at: self.model.deployed_at,
            live_override: self.model.live_override,
            last_event: self.model.events.back().cloned(),
        }
    }

    pub fn mode(&self, now: DateTime<Utc>) -> BufferMode {
        if self.model.live_override {
            return BufferMode::Live;
        }
        let observation_ends = self.model.deployed_at
            + Duration::days(self.cfg.observation_days + self.model.extra_observation_days);
        if now >= observation_ends {
            BufferMode::Live
        } else {
            BufferMode::Observation
        }
    }

    /// Explicit operator request: go live immediately.
    pub fn activate_now(&mut self) {
        self.model.live_override = true;
        info!("buffer calculator activated by explicit request");
    }

    /// Explicit operator request: extend the observation period.
    pub fn extend_observation(&mut self, days: i64) {
        self.model.extra_observation_days += days.max(0);
        self.model.live_override = false;
        info!(
            extra_days = self.model.extra_observation_days,
            "buffer observation period extended"
        );
    }

    /// The closed-form floor formula. Returns the target and a
    /// human-readable reason for the event log.
    pub fn target_percent(&self, inputs: &BufferInputs) -> (f64, String) {
        let cfg = &self.cfg;
        if inputs.confidence <= cfg.confidence_threshold {
            let target = Self::round_step(cfg.base_percent, cfg.rounding_step_percent)
                .clamp(cfg.hard_floor_percent, 100.0);
            return (
                target,
                format!(
                    "confidence {:.2} at or below threshold {:.2}, full buffer",
                    inputs.confidence, cfg.confidence_threshold
                ),
            );
        }

        let span = ((inputs.confidence - cfg.confidence_threshold)
            / (1.0 - cfg.confidence_threshold))
            .clamp(0.0, 1.0);
        let mut target =
            cfg.base_percent - span * (cfg.base_percent - cfg.practical_min_percent);
        let mut reason = format!(
            "confidence {:.2} reduces buffer by {:.1}%",
            inputs.confidence,
            span * (cfg.base_percent - cfg.practical_min_percent)
        );

        if inputs.price_spread >= cfg.spread_threshold {
            target -= cfg.spread_bonus_percent;
            reason.push_str(&format!(
                ", spread {:.2} bonus -{:.0}%",
                inputs.price_spread, cfg.spread_bonus_percent
            ));
        }
        if (cfg.predawn_start_hour..=cfg.predawn_end_hour).contains(&inputs.hour)
            && inputs.pv_next_6h_kwh >= cfg.predawn_pv_min_kwh
        {
            target -= cfg.predawn_bonus_percent;
            reason.push_str(&format!(
                ", pre-dawn solar ramp ({:.1} kWh) bonus -{:.0}%",
                inputs.pv_next_6h_kwh, cfg.predawn_bonus_percent
            ));
        }

        // Reduction stops at the practical minimum; the hard floor holds
        // for any input combination, tunable coefficients included.
        target = target.max(cfg.practical_min_percent);
        target = Self::round_step(target, cfg.rounding_step_percent);
        target = target.clamp(cfg.hard_floor_percent, 100.0);
        (target, reason)
    }

    /// Run one cycle: compute the target, record the event, and in live
    /// mode report whether the hardware path must be called.
    pub fn evaluate(&mut self, inputs: BufferInputs, now: DateTime<Utc>) -> BufferDecision {
        let (target, reason) = self.target_percent(&inputs);
        let mode = self.mode(now);
        let old = self.model.current_percent;

        let apply = match mode {
            BufferMode::Observation => None,
            // Only call the control path on change, never unconditionally.
            BufferMode::Live if (target - old).abs() > f64::EPSILON => Some(target),
            BufferMode::Live => None,
        };
        if let Some(value) = apply {
            self.model.current_percent = value;
        }

        self.push_event(BufferEvent {
            at: now,
            inputs,
            old_percent: old,
            new_percent: target,
            reason,
            applied: apply.is_some(),
        });
        debug!(
            mode = %mode,
            target_percent = target,
            applied = apply.is_some(),
            "buffer evaluation"
        );

        BufferDecision {
            target_percent: target,
            mode,
            apply,
        }
    }

    fn push_event(&mut self, event: BufferEvent) {
        self.model.events.push_back(event);
        while self.model.events.len() > self.cfg.event_log_capacity {
            self.model.events.pop_front();
        }
    }

    fn round_step(value: f64, step: f64) -> f64 {
        if step <= f64::EPSILON {
            return value;
        }
        (value / step).round() * step
    }
}
