//! Systematic planner-bias tracking by season, time of day and weekday.
//!
//! A small fixed table of cells, each holding a visit count and an
//! exponentially-decayed average of planner prediction error. The decayed
//! update is bounded so a single outlier cycle can never erase months of
//! accumulated signal. The current cell is exposed as two numeric features
//! to the residual agent's state representation.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

const SEASONS: usize = 4;
const TOD_BUCKETS: usize = 6;
const CELLS: usize = SEASONS * TOD_BUCKETS * 2;

/// Visits after which the cell's confidence feature saturates at ~0.8.
const CONFIDENCE_HALF_LIFE: f64 = 20.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonalCell {
    /// Only ever increases.
    pub count: u64,
    /// Decayed average planner error (predicted cost minus realized cost).
    pub avg_error: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonalLearner {
    /// Per-update decay weight, capped so old signal is never overwritten.
    decay: f64,
    cells: Vec<SeasonalCell>,
}

/// The two features handed to the residual agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeasonalFeatures {
    /// Typical planner error in this context, in cents.
    pub bias_ct: f64,
    /// How much history backs that estimate, in [0, 1].
    pub confidence: f64,
}

impl SeasonalLearner {
    pub fn new(decay: f64) -> Self {
        Self {
            decay: decay.clamp(0.01, 0.5),
            cells: vec![SeasonalCell::default(); CELLS],
        }
    }

    fn index(at: DateTime<Utc>) -> usize {
        let season = (at.month0() / 3) as usize;
        let tod = (at.hour() as usize) / (24 / TOD_BUCKETS);
        let weekend = matches!(at.weekday(), Weekday::Sat | Weekday::Sun) as usize;
        (season * TOD_BUCKETS + tod) * 2 + weekend
    }

    /// Fold one observed planner error into the matching cell.
    pub fn record(&mut self, at: DateTime<Utc>, error_ct: f64) {
        let cell = &mut self.cells[Self::index(at)];
        if cell.count == 0 {
            cell.avg_error = error_ct;
        } else {
            // Bounded decay, never a full overwrite.
            cell.avg_error = cell.avg_error * (1.0 - self.decay) + error_ct * self.decay;
        }
        cell.count += 1;
    }

    pub fn cell(&self, at: DateTime<Utc>) -> SeasonalCell {
        self.cells[Self::index(at)]
    }

    pub fn features(&self, at: DateTime<Utc>) -> SeasonalFeatures {
        let cell = self.cell(at);
        SeasonalFeatures {
            bias_ct: cell.avg_error,
            confidence: cell.count as f64 / (cell.count as f64 + CONFIDENCE_HALF_LIFE),
        }
    }
}

impl Default for SeasonalLearner {
    fn default() -> Self {
        Self::new(0.1)
    }
}
