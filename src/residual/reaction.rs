//! Learned re-plan timing.
//!
//! Tracks, with an exponentially-weighted moving average, how often
//! observed deviations from plan self-correct within the same cycle. When
//! deviations mostly do not self-correct, the tracker recommends an
//! immediate re-plan instead of waiting for the next scheduled cycle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactionTimingTracker {
    /// EWMA of "the deviation self-corrected", in [0, 1].
    self_correct_rate: f64,
    threshold: f64,
    alpha: f64,
    samples: u64,
}

impl ReactionTimingTracker {
    pub fn new(prior: f64, threshold: f64, alpha: f64) -> Self {
        Self {
            self_correct_rate: prior.clamp(0.0, 1.0),
            threshold: threshold.clamp(0.0, 1.0),
            alpha: alpha.clamp(0.001, 1.0),
            samples: 0,
        }
    }

    /// Record whether the last observed deviation resolved on its own.
    pub fn record(&mut self, self_corrected: bool) {
        let observation = if self_corrected { 1.0 } else { 0.0 };
        self.self_correct_rate =
            self.self_correct_rate * (1.0 - self.alpha) + observation * self.alpha;
        self.samples += 1;
    }

    /// True when deviations rarely self-correct and waiting out the cycle
    /// is the wrong move.
    pub fn should_replan_immediately(&self) -> bool {
        self.self_correct_rate < self.threshold
    }

    pub fn self_correct_rate(&self) -> f64 {
        self.self_correct_rate
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

impl Default for ReactionTimingTracker {
    fn default() -> Self {
        Self::new(0.5, 0.35, 0.05)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_above_threshold_waits() {
        let tracker = ReactionTimingTracker::default();
        assert!(!tracker.should_replan_immediately());
    }

    #[test]
    fn persistent_uncorrected_deviations_trigger_replan() {
        let mut tracker = ReactionTimingTracker::default();
        for _ in 0..60 {
            tracker.record(false);
        }
        assert!(tracker.should_replan_immediately());
    }

    #[test]
    fn self_correcting_system_keeps_waiting() {
        let mut tracker = ReactionTimingTracker::default();
        for _ in 0..60 {
            tracker.record(true);
        }
        assert!(!tracker.should_replan_immediately());
        assert!(tracker.self_correct_rate() > 0.9);
    }

    #[test]
    fn serde_round_trip() {
        let mut tracker = ReactionTimingTracker::new(0.6, 0.3, 0.1);
        tracker.record(false);
        tracker.record(true);
        let json = serde_json::to_string(&tracker).unwrap();
        let restored: ReactionTimingTracker = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.self_correct_rate(), tracker.self_correct_rate());
        assert_eq!(restored.samples(), 2);
    }
}
