//! Forecast collaborator boundaries.
//!
//! The real system talks to external forecast services; the decision core
//! only sees these traits. Each returns a 96-slot (15-minute) series plus a
//! coverage/confidence scalar. The built-in profile implementations give the
//! simulated closed loop plausible shapes to plan against.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};

use crate::domain::{HORIZON_SLOTS, SLOT_MINUTES};

/// Price forecast series. May cover fewer than 96 slots when the day-ahead
/// auction has not published the full window yet.
#[derive(Debug, Clone)]
pub struct PriceSeries {
    pub ct_kwh: Vec<f64>,
    /// Fraction of the full horizon the series covers, in [0, 1].
    pub coverage: f64,
}

/// Power forecast series (PV or consumption), always 96 slots.
#[derive(Debug, Clone)]
pub struct PowerSeries {
    pub watts: Vec<f64>,
    pub confidence: f64,
}

#[async_trait]
pub trait PriceForecaster: Send + Sync {
    async fn forecast_96(&self, from: DateTime<Utc>) -> Result<PriceSeries>;
}

#[async_trait]
pub trait PvForecaster: Send + Sync {
    async fn forecast_96(&self, from: DateTime<Utc>) -> Result<PowerSeries>;
}

#[async_trait]
pub trait ConsumptionForecaster: Send + Sync {
    async fn forecast_96(&self, from: DateTime<Utc>) -> Result<PowerSeries>;
}

fn slot_hours(from: DateTime<Utc>) -> impl Iterator<Item = f64> {
    (0..HORIZON_SLOTS).map(move |i| {
        let t = from + chrono::Duration::minutes(i as i64 * SLOT_MINUTES);
        t.hour() as f64 + t.minute() as f64 / 60.0
    })
}

/// Day/night tariff profile: cheap overnight, expensive across the morning
/// and evening peaks.
pub struct DayNightPriceForecaster {
    pub base_ct: f64,
    pub night_discount_ct: f64,
    pub peak_premium_ct: f64,
}

impl Default for DayNightPriceForecaster {
    fn default() -> Self {
        Self {
            base_ct: 28.0,
            night_discount_ct: 10.0,
            peak_premium_ct: 12.0,
        }
    }
}

#[async_trait]
impl PriceForecaster for DayNightPriceForecaster {
    async fn forecast_96(&self, from: DateTime<Utc>) -> Result<PriceSeries> {
        let ct_kwh = slot_hours(from)
            .map(|hh| {
                if !(6.0..22.0).contains(&hh) {
                    self.base_ct - self.night_discount_ct
                } else if (7.0..9.0).contains(&hh) || (17.0..20.0).contains(&hh) {
                    self.base_ct + self.peak_premium_ct
                } else {
                    self.base_ct
                }
            })
            .collect();
        Ok(PriceSeries {
            ct_kwh,
            coverage: 1.0,
        })
    }
}

/// Clear-sky sine profile between sunrise and sunset, scaled by a cloud
/// factor.
pub struct ClearSkyPvForecaster {
    pub peak_kw: f64,
    pub sunrise: f64,
    pub sunset: f64,
    pub cloud_factor: f64,
    pub confidence: f64,
}

impl Default for ClearSkyPvForecaster {
    fn default() -> Self {
        Self {
            peak_kw: 8.0,
            sunrise: 6.5,
            sunset: 20.0,
            cloud_factor: 0.8,
            confidence: 0.75,
        }
    }
}

#[async_trait]
impl PvForecaster for ClearSkyPvForecaster {
    async fn forecast_96(&self, from: DateTime<Utc>) -> Result<PowerSeries> {
        let day_len = (self.sunset - self.sunrise).max(0.01);
        let watts = slot_hours(from)
            .map(|hh| {
                if hh < self.sunrise || hh > self.sunset {
                    0.0
                } else {
                    let x = (hh - self.sunrise) / day_len;
                    (std::f64::consts::PI * x).sin().max(0.0)
                        * self.peak_kw
                        * self.cloud_factor
                        * 1000.0
                }
            })
            .collect();
        Ok(PowerSeries {
            watts,
            confidence: self.confidence,
        })
    }
}

/// Flat baseline with morning and evening bumps.
pub struct BaselineConsumptionForecaster {
    pub base_kw: f64,
    pub bump_kw: f64,
    pub confidence: f64,
}

impl Default for BaselineConsumptionForecaster {
    fn default() -> Self {
        Self {
            base_kw: 0.6,
            bump_kw: 1.2,
            confidence: 0.85,
        }
    }
}

#[async_trait]
impl ConsumptionForecaster for BaselineConsumptionForecaster {
    async fn forecast_96(&self, from: DateTime<Utc>) -> Result<PowerSeries> {
        let watts = slot_hours(from)
            .map(|hh| {
                let bump = if (6.5..9.0).contains(&hh) || (17.0..21.5).contains(&hh) {
                    self.bump_kw
                } else {
                    0.0
                };
                (self.base_kw + bump) * 1000.0
            })
            .collect();
        Ok(PowerSeries {
            watts,
            confidence: self.confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn price_profile_covers_full_horizon() {
        let series = DayNightPriceForecaster::default()
            .forecast_96(Utc::now())
            .await
            .unwrap();
        assert_eq!(series.ct_kwh.len(), HORIZON_SLOTS);
        assert_eq!(series.coverage, 1.0);
    }

    #[tokio::test]
    async fn pv_profile_is_dark_at_night_and_positive_at_noon() {
        let forecaster = ClearSkyPvForecaster::default();
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let series = forecaster.forecast_96(midnight).await.unwrap();
        assert_eq!(series.watts[0], 0.0);
        // Slot 48 is noon when the horizon starts at midnight.
        assert!(series.watts[48] > 1000.0);
    }

    #[tokio::test]
    async fn consumption_never_below_baseline() {
        let forecaster = BaselineConsumptionForecaster::default();
        let series = forecaster.forecast_96(Utc::now()).await.unwrap();
        assert!(series
            .watts
            .iter()
            .all(|w| *w >= forecaster.base_kw * 1000.0 - 1e-9));
    }
}
