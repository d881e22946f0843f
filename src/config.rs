use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub controller: ControllerConfig,
    pub battery: BatteryConfig,
    pub ev: EvConfig,
    pub planner: PlannerConfig,
    pub buffer: BufferConfig,
    pub residual: ResidualConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Decision-loop cadence. One dispatch slot per cycle.
    pub cycle_minutes: u64,
    pub forecast_refresh_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryConfig {
    pub capacity_kwh: f64,
    pub max_charge_kw: f64,
    pub max_discharge_kw: f64,
    pub charge_efficiency: f64,
    pub discharge_efficiency: f64,
    /// Configured static safety minimum. The dynamic buffer may raise the
    /// effective floor above this, never push it below the hard floor.
    pub min_soc_percent: f64,
    pub max_soc_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvConfig {
    pub capacity_kwh: f64,
    pub max_charge_kw: f64,
    pub charge_efficiency: f64,
    pub target_soc_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    /// Hard wall-clock budget for one LP solve.
    pub solver_budget_secs: u64,
    pub feed_in_ct_kwh: f64,
    /// Fuse limit on total grid import.
    pub grid_limit_kw: f64,
    /// Objective penalty per SoC percentage point of departure shortfall.
    pub departure_penalty_ct_per_percent: f64,
}

/// Coefficients of the dynamic-buffer formula. Empirically tuned during the
/// observation period; deliberately configuration rather than constants.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    pub base_percent: f64,
    pub practical_min_percent: f64,
    pub hard_floor_percent: f64,
    pub confidence_threshold: f64,
    pub spread_threshold: f64,
    pub spread_bonus_percent: f64,
    pub predawn_start_hour: u32,
    pub predawn_end_hour: u32,
    pub predawn_pv_min_kwh: f64,
    pub predawn_bonus_percent: f64,
    pub rounding_step_percent: f64,
    pub observation_days: i64,
    pub event_log_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResidualConfig {
    /// Half-width of the symmetric delta set, in ct/kWh.
    pub clamp_ct: f64,
    /// Spacing between adjacent deltas, in ct/kWh.
    pub step_ct: f64,
    pub learning_rate: f64,
    pub epsilon_start: f64,
    pub epsilon_min: f64,
    pub epsilon_decay: f64,
    /// Minimum shadow-mode observation window before promotion.
    pub audit_window_days: i64,
    pub replay_capacity: usize,
    pub batch_size: usize,
    /// Initial prior for the reaction tracker's self-correction rate.
    pub reaction_prior: f64,
    pub reaction_threshold: f64,
    pub reaction_alpha: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("PEC__").split("__"));
        Ok(figment.extract()?)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8087,
            enable_cors: false,
            request_timeout_secs: 10,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cycle_minutes: 15,
            forecast_refresh_minutes: 60,
        }
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 10.0,
            max_charge_kw: 5.0,
            max_discharge_kw: 5.0,
            charge_efficiency: 0.95,
            discharge_efficiency: 0.95,
            min_soc_percent: 20.0,
            max_soc_percent: 95.0,
        }
    }
}

impl Default for EvConfig {
    fn default() -> Self {
        Self {
            capacity_kwh: 60.0,
            max_charge_kw: 11.0,
            charge_efficiency: 0.92,
            target_soc_percent: 80.0,
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            solver_budget_secs: 5,
            feed_in_ct_kwh: 8.0,
            grid_limit_kw: 14.5,
            departure_penalty_ct_per_percent: 500.0,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            base_percent: 40.0,
            practical_min_percent: 20.0,
            hard_floor_percent: 10.0,
            confidence_threshold: 0.65,
            spread_threshold: 0.10,
            spread_bonus_percent: 5.0,
            predawn_start_hour: 4,
            predawn_end_hour: 7,
            predawn_pv_min_kwh: 4.0,
            predawn_bonus_percent: 5.0,
            rounding_step_percent: 5.0,
            observation_days: 14,
            event_log_capacity: 192,
        }
    }
}

impl Default for ResidualConfig {
    fn default() -> Self {
        Self {
            clamp_ct: 20.0,
            step_ct: 5.0,
            learning_rate: 0.1,
            epsilon_start: 0.2,
            epsilon_min: 0.02,
            epsilon_decay: 0.999,
            audit_window_days: 30,
            replay_capacity: 8192,
            batch_size: 16,
            reaction_prior: 0.5,
            reaction_threshold: 0.35,
            reaction_alpha: 0.05,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            controller: ControllerConfig::default(),
            battery: BatteryConfig::default(),
            ev: EvConfig::default(),
            planner: PlannerConfig::default(),
            buffer: BufferConfig::default(),
            residual: ResidualConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_toml_round_trips() {
        let cfg = Config::default();
        assert_eq!(cfg.controller.cycle_minutes, 15);
        assert!(cfg.buffer.hard_floor_percent <= cfg.buffer.practical_min_percent);
        assert!(cfg.buffer.practical_min_percent <= cfg.buffer.base_percent);
    }

    #[test]
    fn section_parses_from_toml() {
        let buffer: BufferConfig = toml::from_str(
            r#"
            base_percent = 50.0
            practical_min_percent = 25.0
            hard_floor_percent = 10.0
            confidence_threshold = 0.7
            spread_threshold = 0.12
            spread_bonus_percent = 4.0
            predawn_start_hour = 4
            predawn_end_hour = 7
            predawn_pv_min_kwh = 3.0
            predawn_bonus_percent = 5.0
            rounding_step_percent = 5.0
            observation_days = 21
            event_log_capacity = 100
            "#,
        )
        .unwrap();
        assert_eq!(buffer.base_percent, 50.0);
        assert_eq!(buffer.observation_days, 21);
    }
}
