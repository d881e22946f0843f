//! Rolling forecast-reliability tracking.
//!
//! Keeps a bounded window of (actual, predicted) pairs per forecast signal
//! and condenses it into a 0-1 multiplier. The planner uses the PV
//! multiplier to scale down surplus assumptions; the buffer calculator
//! multiplies raw forecaster confidence by it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use strum::Display;

/// Which forecast input a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ForecastSignal {
    Pv,
    Consumption,
    Price,
}

impl ForecastSignal {
    fn index(self) -> usize {
        match self {
            Self::Pv => 0,
            Self::Consumption => 1,
            Self::Price => 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SignalWindow {
    samples: VecDeque<(f64, f64)>,
}

impl SignalWindow {
    fn mae(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().map(|(a, p)| (a - p).abs()).sum();
        Some(sum / self.samples.len() as f64)
    }

    fn mean_abs_actual(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|(a, _)| a.abs()).sum::<f64>() / self.samples.len() as f64
    }
}

/// Rolling mean-absolute-error per forecast input, exposed as a 0-1
/// reliability multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastReliabilityTracker {
    window: usize,
    signals: [SignalWindow; 3],
}

impl ForecastReliabilityTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            signals: Default::default(),
        }
    }

    /// Record one realized (actual, predicted) pair for a signal.
    pub fn record(&mut self, signal: ForecastSignal, actual: f64, predicted: f64) {
        let w = &mut self.signals[signal.index()];
        w.samples.push_back((actual, predicted));
        while w.samples.len() > self.window {
            w.samples.pop_front();
        }
    }

    /// Rolling MAE for a signal. `None` until the first sample arrives.
    pub fn mae(&self, signal: ForecastSignal) -> Option<f64> {
        self.signals[signal.index()].mae()
    }

    /// Reliability multiplier in [0, 1]. A signal with no samples reports
    /// 1.0: a fresh install trusts its forecasters until evidence arrives.
    pub fn multiplier(&self, signal: ForecastSignal) -> f64 {
        let w = &self.signals[signal.index()];
        let Some(mae) = w.mae() else {
            return 1.0;
        };
        let scale = w.mean_abs_actual();
        if scale <= f64::EPSILON {
            return 1.0;
        }
        (1.0 - (mae / scale).clamp(0.0, 1.0)).clamp(0.0, 1.0)
    }
}

impl Default for ForecastReliabilityTracker {
    fn default() -> Self {
        Self::new(96)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tracker_reports_full_trust() {
        let tracker = ForecastReliabilityTracker::default();
        assert_eq!(tracker.multiplier(ForecastSignal::Pv), 1.0);
        assert!(tracker.mae(ForecastSignal::Pv).is_none());
    }

    #[test]
    fn perfect_forecasts_keep_multiplier_at_one() {
        let mut tracker = ForecastReliabilityTracker::default();
        for _ in 0..10 {
            tracker.record(ForecastSignal::Consumption, 800.0, 800.0);
        }
        assert_eq!(tracker.multiplier(ForecastSignal::Consumption), 1.0);
    }

    #[test]
    fn large_errors_degrade_multiplier() {
        let mut tracker = ForecastReliabilityTracker::default();
        for _ in 0..10 {
            tracker.record(ForecastSignal::Pv, 1000.0, 3000.0);
        }
        let m = tracker.multiplier(ForecastSignal::Pv);
        assert!(m < 0.2, "multiplier {m} should collapse for 200% errors");
    }

    #[test]
    fn window_is_bounded() {
        let mut tracker = ForecastReliabilityTracker::new(4);
        // Four bad samples, then many perfect ones push them out.
        for _ in 0..4 {
            tracker.record(ForecastSignal::Price, 30.0, 90.0);
        }
        for _ in 0..4 {
            tracker.record(ForecastSignal::Price, 30.0, 30.0);
        }
        assert_eq!(tracker.multiplier(ForecastSignal::Price), 1.0);
    }

    #[test]
    fn signals_are_independent() {
        let mut tracker = ForecastReliabilityTracker::default();
        tracker.record(ForecastSignal::Pv, 1000.0, 5000.0);
        assert!(tracker.multiplier(ForecastSignal::Pv) < 1.0);
        assert_eq!(tracker.multiplier(ForecastSignal::Consumption), 1.0);
    }
}
