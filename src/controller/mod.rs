//! Decision loop orchestration.
//!
//! One cycle per dispatch slot: refresh forecasts, snapshot the system,
//! solve the horizon (or fall back), run the buffer calculator, let the
//! residual agent nudge the action under its gating rules, publish, hand
//! off to hardware, and feed the previous cycle's realized outcome back
//! into the learning layer. A failure in any single enhancement degrades
//! to "skip it, keep the safe baseline"; the loop always applies some
//! valid action.

pub mod hardware;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::{
    BufferInputs, BufferModel, DynamicBufferCalc, BUFFER_DOC, BUFFER_SCHEMA_VERSION,
};
use crate::config::Config;
use crate::domain::{
    Action, ActionSource, BatteryMode, DispatchSlot, EvMode, LoadSnapshot, PlanHorizon,
    PlanSnapshot, PriceSnapshot, PriceStats, PvSnapshot, SystemState, SLOT_MINUTES,
};
use crate::forecast::{
    BaselineConsumptionForecaster, ClearSkyPvForecaster, ConsumptionForecaster,
    DayNightPriceForecaster, ForecastReliabilityTracker, ForecastSignal, PowerSeries,
    PriceForecaster, PriceSeries, PvForecaster,
};
use crate::optimizer::{HorizonPlanner, PercentileOptimizer, PlannerConstraints};
use crate::persist::DocumentStore;
use crate::residual::{
    LearningState, ReplayBuffer, ReplayExperience, ResidualRLAgent, SeasonalLearner, StateKey,
    ReactionTimingTracker, REPLAY_DOC, RESIDUAL_DOC, RESIDUAL_SCHEMA_VERSION,
};
use crate::store::StateStore;

pub use hardware::{HardwareControl, MeterReading, SimulatedHardware};

/// Realized-vs-predicted cost difference below which a cycle counts as
/// having gone to plan.
const COST_DEADBAND_CT: f64 = 5.0;
/// Battery-power deviation below which the hardware is considered on plan.
const POWER_DEADBAND_W: f64 = 500.0;
/// Per-fetch budget for a forecast collaborator.
const FORECAST_FETCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
/// Document name and version of the persisted per-cycle solve record.
const PLAN_SNAPSHOT_DOC: &str = "plan_snapshot";
const PLAN_SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub store: Arc<StateStore>,
    pub decision_loop: Arc<DecisionLoop>,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self> {
        let store = Arc::new(StateStore::new());

        #[cfg(feature = "sim")]
        let hardware: Arc<dyn HardwareControl> =
            Arc::new(SimulatedHardware::new(&cfg.battery, 50.0));
        #[cfg(not(feature = "sim"))]
        let hardware: Arc<dyn HardwareControl> = anyhow::bail!(
            "no hardware gateway configured; enable the `sim` feature or wire a gateway implementation"
        );

        let docs = DocumentStore::new(&cfg.persistence.data_dir)?;
        let decision_loop = Arc::new(DecisionLoop::new(
            cfg.clone(),
            store.clone(),
            hardware,
            Box::new(DayNightPriceForecaster::default()),
            Box::new(ClearSkyPvForecaster::default()),
            Box::new(BaselineConsumptionForecaster::default()),
            docs,
        ));

        Ok(Self {
            cfg,
            store,
            decision_loop,
        })
    }
}

pub fn spawn_controller_tasks(state: AppState, token: CancellationToken) {
    let decision_loop = state.decision_loop.clone();
    let cycle_minutes = state.cfg.controller.cycle_minutes.max(1);
    let loop_token = token.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(cycle_minutes * 60));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = loop_token.cancelled() => {
                    info!("decision loop stopped");
                    break;
                }
            }
            match decision_loop.run_cycle().await {
                Ok(outcome) if outcome.replan_recommended => {
                    debug!("deviation did not self-correct; re-planning immediately");
                    if let Err(e) = decision_loop.run_cycle().await {
                        warn!(error = %e, "immediate re-plan failed");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "decision cycle failed"),
            }
        }
    });

    let decision_loop = state.decision_loop.clone();
    let refresh_minutes = state.cfg.controller.forecast_refresh_minutes.max(1);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(refresh_minutes * 60));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = token.cancelled() => {
                    info!("forecast refresh stopped");
                    break;
                }
            }
            decision_loop.refresh_forecasts().await;
        }
    });
}

#[derive(Default)]
struct ForecastCache {
    price: Option<PriceSeries>,
    pv: Option<PowerSeries>,
    load: Option<PowerSeries>,
    refreshed_at: Option<DateTime<Utc>>,
}

struct Learning {
    buffer: DynamicBufferCalc,
    agent: ResidualRLAgent,
    seasonal: SeasonalLearner,
    reaction: ReactionTimingTracker,
    replay: ReplayBuffer,
    reliability: ForecastReliabilityTracker,
    pending: Option<PendingOutcome>,
}

/// Previous cycle's decision, held until this cycle's realized outcome
/// arrives. Training always pairs the old action with the new outcome.
struct PendingOutcome {
    at: DateTime<Utc>,
    state_key: StateKey,
    delta_index: usize,
    predicted_cost_ct: f64,
    planned_battery_power_w: f64,
    forecast_pv_w: f64,
    forecast_load_w: f64,
    forecast_price_ct: f64,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub action: Action,
    pub replan_recommended: bool,
}

pub struct DecisionLoop {
    cfg: Config,
    store: Arc<StateStore>,
    hardware: Arc<dyn HardwareControl>,
    price_forecaster: Box<dyn PriceForecaster>,
    pv_forecaster: Box<dyn PvForecaster>,
    consumption_forecaster: Box<dyn ConsumptionForecaster>,
    planner: HorizonPlanner,
    fallback: PercentileOptimizer,
    docs: DocumentStore,
    forecasts: RwLock<ForecastCache>,
    learning: Mutex<Learning>,
}

impl DecisionLoop {
    pub fn new(
        cfg: Config,
        store: Arc<StateStore>,
        hardware: Arc<dyn HardwareControl>,
        price_forecaster: Box<dyn PriceForecaster>,
        pv_forecaster: Box<dyn PvForecaster>,
        consumption_forecaster: Box<dyn ConsumptionForecaster>,
        docs: DocumentStore,
    ) -> Self {
        let now = Utc::now();

        let buffer = match docs.load::<BufferModel>(BUFFER_DOC, BUFFER_SCHEMA_VERSION) {
            Ok(Some(model)) => DynamicBufferCalc::from_model(cfg.buffer.clone(), model),
            Ok(None) => DynamicBufferCalc::new(cfg.buffer.clone(), now),
            Err(e) => {
                warn!(error = %e, "buffer model unreadable, rebuilding from defaults");
                DynamicBufferCalc::new(cfg.buffer.clone(), now)
            }
        };

        let (agent, seasonal, reaction) =
            match docs.load::<LearningState>(RESIDUAL_DOC, RESIDUAL_SCHEMA_VERSION) {
                Ok(Some(state)) => (
                    ResidualRLAgent::from_table(cfg.residual.clone(), state.agent),
                    state.seasonal,
                    state.reaction,
                ),
                Ok(None) => Self::fresh_learning(&cfg, now),
                Err(e) => {
                    warn!(error = %e, "residual state unreadable, rebuilding from defaults");
                    Self::fresh_learning(&cfg, now)
                }
            };

        let replay = match docs.load::<ReplayBuffer>(REPLAY_DOC, RESIDUAL_SCHEMA_VERSION) {
            Ok(Some(buffer)) => buffer,
            Ok(None) => ReplayBuffer::new(cfg.residual.replay_capacity),
            Err(e) => {
                warn!(error = %e, "replay buffer unreadable, rebuilding from defaults");
                ReplayBuffer::new(cfg.residual.replay_capacity)
            }
        };

        Self {
            store,
            hardware,
            price_forecaster,
            pv_forecaster,
            consumption_forecaster,
            planner: HorizonPlanner,
            fallback: PercentileOptimizer::default(),
            docs,
            forecasts: RwLock::new(ForecastCache::default()),
            learning: Mutex::new(Learning {
                buffer,
                agent,
                seasonal,
                reaction,
                replay,
                reliability: ForecastReliabilityTracker::default(),
                pending: None,
            }),
            cfg,
        }
    }

    fn fresh_learning(
        cfg: &Config,
        now: DateTime<Utc>,
    ) -> (ResidualRLAgent, SeasonalLearner, ReactionTimingTracker) {
        (
            ResidualRLAgent::new(cfg.residual.clone(), now),
            SeasonalLearner::default(),
            ReactionTimingTracker::new(
                cfg.residual.reaction_prior,
                cfg.residual.reaction_threshold,
                cfg.residual.reaction_alpha,
            ),
        )
    }

    /// Fetch all three forecast series. Each fetch fails soft: on error or
    /// timeout the previous series stays in the cache.
    pub async fn refresh_forecasts(&self) {
        let now = Utc::now();
        let mut cache = self.forecasts.write().await;

        match tokio::time::timeout(FORECAST_FETCH_TIMEOUT, self.price_forecaster.forecast_96(now))
            .await
        {
            Ok(Ok(series)) => cache.price = Some(series),
            Ok(Err(e)) => warn!(error = %e, "price forecast failed, keeping stale data"),
            Err(_) => warn!("price forecast timed out, keeping stale data"),
        }
        match tokio::time::timeout(FORECAST_FETCH_TIMEOUT, self.pv_forecaster.forecast_96(now))
            .await
        {
            Ok(Ok(series)) => cache.pv = Some(series),
            Ok(Err(e)) => warn!(error = %e, "pv forecast failed, keeping stale data"),
            Err(_) => warn!("pv forecast timed out, keeping stale data"),
        }
        match tokio::time::timeout(
            FORECAST_FETCH_TIMEOUT,
            self.consumption_forecaster.forecast_96(now),
        )
        .await
        {
            Ok(Ok(series)) => cache.load = Some(series),
            Ok(Err(e)) => warn!(error = %e, "consumption forecast failed, keeping stale data"),
            Err(_) => warn!("consumption forecast timed out, keeping stale data"),
        }
        cache.refreshed_at = Some(now);
    }

    async fn ensure_fresh_forecasts(&self, now: DateTime<Utc>) {
        let stale = {
            let cache = self.forecasts.read().await;
            cache.refreshed_at.map_or(true, |t| {
                now.signed_duration_since(t)
                    >= Duration::minutes(self.cfg.controller.cycle_minutes as i64)
            })
        };
        if stale {
            self.refresh_forecasts().await;
        }
    }

    /// Operator request: put the buffer calculator live immediately,
    /// skipping the rest of the observation period.
    pub async fn activate_buffer_now(&self) {
        let mut learning = self.learning.lock().await;
        learning.buffer.activate_now();
        self.store.set_buffer_status(learning.buffer.status(Utc::now()));
    }

    /// Operator request: extend the buffer observation period.
    pub async fn extend_buffer_observation(&self, days: i64) {
        let mut learning = self.learning.lock().await;
        learning.buffer.extend_observation(days);
        self.store.set_buffer_status(learning.buffer.status(Utc::now()));
    }

    /// Operator request: promote the residual agent from shadow to
    /// advisory. Refused unless the audit passes.
    pub async fn promote_residual_agent(&self) -> Result<(), crate::residual::PromotionError> {
        let mut learning = self.learning.lock().await;
        learning.agent.promote(Utc::now())
    }

    /// Assemble the immutable per-cycle snapshot. Missing forecasts
    /// degrade to empty series / zero confidence rather than failing.
    async fn collect_state(&self, now: DateTime<Utc>) -> Result<SystemState> {
        let battery = self.hardware.read_battery().await?;
        let ev = match self.hardware.read_ev().await {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "vehicle read failed, treating as disconnected");
                None
            }
        };
        let meter = match self.hardware.read_meter().await {
            Ok(meter) => meter,
            Err(e) => {
                warn!(error = %e, "meter read failed, using zero readings");
                MeterReading::default()
            }
        };

        let cache = self.forecasts.read().await;
        let forecast_ct_kwh = cache
            .price
            .as_ref()
            .map(|p| p.ct_kwh.clone())
            .unwrap_or_default();
        let stats = PriceStats::from_series(&forecast_ct_kwh).unwrap_or_default();
        let price = PriceSnapshot {
            current_ct_kwh: forecast_ct_kwh.first().copied().unwrap_or(0.0),
            forecast_ct_kwh,
            stats,
        };
        let pv = PvSnapshot {
            power_w: meter.pv_power_w,
            forecast_w: cache
                .pv
                .as_ref()
                .map(|s| s.watts.clone())
                .unwrap_or_default(),
            confidence: cache.pv.as_ref().map_or(0.0, |s| s.confidence),
        };
        let load = LoadSnapshot {
            power_w: meter.load_power_w,
            forecast_w: cache
                .load
                .as_ref()
                .map(|s| s.watts.clone())
                .unwrap_or_default(),
            confidence: cache.load.as_ref().map_or(0.0, |s| s.confidence),
        };

        Ok(SystemState {
            captured_at: now,
            battery,
            ev,
            price,
            pv,
            load,
        })
    }

    /// One full decision cycle.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let now = Utc::now();
        self.ensure_fresh_forecasts(now).await;

        let state = match self.collect_state(now).await {
            Ok(state) => state,
            Err(e) => {
                // Without a battery reading there is nothing to optimize,
                // but the cycle still emits a valid action.
                warn!(error = %e, "state collection failed, holding everything");
                let action =
                    Action::hold_all(self.cfg.battery.min_soc_percent, ActionSource::Fallback);
                if let Err(e) = self.hardware.apply(&action).await {
                    warn!(error = %e, "hold action could not be applied");
                }
                self.store.set_action(action.clone());
                return Ok(CycleOutcome {
                    action,
                    replan_recommended: false,
                });
            }
        };
        self.store.update(state.clone());

        let mut learning = self.learning.lock().await;

        // Realized outcome of the previous cycle, fed back before this
        // cycle's decision so training never looks ahead.
        let realized_error = self.absorb_previous_outcome(&mut learning, &state);

        let pv_reliability = learning.reliability.multiplier(ForecastSignal::Pv);
        let applied_floor = learning.buffer.model().current_percent;
        let constraints = PlannerConstraints::from_config(
            &self.cfg.battery,
            &self.cfg.ev,
            &self.cfg.planner,
        )
        .with_effective_floor(applied_floor);

        let (plan, base_action) =
            match self.planner.plan(&state, &constraints, pv_reliability).await {
                Ok(plan) => {
                    let action = action_from_plan(&plan, &constraints);
                    (plan, action)
                }
                Err(e) => {
                    warn!(error = %e, "planner unavailable, using percentile fallback");
                    let action = self.fallback.optimize(&state, &constraints);
                    let plan = self.fallback.as_plan(&state, &constraints, &action);
                    (plan, action)
                }
            };
        if let Some(shortfall) = plan.departure_shortfall_percent {
            warn!(
                shortfall_percent = shortfall,
                "departure target unreachable with available charge power"
            );
        }

        // Buffer evaluation is skipped outright while the battery-to-EV
        // arbitrage sequencer owns the control value.
        if self.hardware.is_bat_to_ev_arbitrage_active() {
            debug!("battery-to-EV arbitrage active, buffer evaluation skipped");
        } else {
            let confidence = (state.pv.confidence * pv_reliability).clamp(0.0, 1.0);
            let inputs = BufferInputs::at(
                now,
                confidence,
                state.price.stats.spread,
                state.pv.forecast_sum_kwh(24),
            );
            let decision = learning.buffer.evaluate(inputs, now);
            if let Some(value) = decision.apply {
                if let Err(e) = self.hardware.set_min_soc(value).await {
                    warn!(error = %e, "min-SoC update failed, retrying next cycle");
                }
            }
        }
        self.store.set_buffer_status(learning.buffer.status(now));

        let features = learning.seasonal.features(now);
        let state_key = StateKey::from_state(&state, &constraints, features);
        let (final_action, residual) =
            learning
                .agent
                .decide(state_key, &base_action, &mut rand::thread_rng());

        let predicted_cost_ct = plan
            .first_slot()
            .map(|slot| slot_cost_ct(slot, constraints.feed_in_ct_kwh))
            .unwrap_or(0.0);
        let planned_battery_power_w = plan
            .first_slot()
            .map(|slot| slot.battery_charge_w - slot.battery_discharge_w)
            .unwrap_or(0.0);
        learning.pending = Some(PendingOutcome {
            at: now,
            state_key,
            delta_index: residual.delta_index,
            predicted_cost_ct,
            planned_battery_power_w,
            forecast_pv_w: state.pv.forecast_w.first().copied().unwrap_or(0.0),
            forecast_load_w: state.load.forecast_w.first().copied().unwrap_or(0.0),
            forecast_price_ct: state.price.current_ct_kwh,
        });

        let replan_recommended = realized_error
            .map(|deviated| deviated && learning.reaction.should_replan_immediately())
            .unwrap_or(false);

        let persisted = (
            learning.buffer.model().clone(),
            LearningState {
                agent: learning.agent.table(),
                seasonal: learning.seasonal.clone(),
                reaction: learning.reaction.clone(),
            },
            learning.replay.clone(),
            plan.snapshot(),
        );
        drop(learning);

        self.store.update_plan(plan);
        self.store.set_action(final_action.clone());
        if let Err(e) = self.hardware.apply(&final_action).await {
            warn!(error = %e, "action hand-off failed");
        }

        info!(
            battery_mode = %final_action.battery_mode,
            ev_mode = %final_action.ev_mode,
            soc_floor_percent = final_action.soc_floor_percent,
            source = %final_action.source,
            residual_delta_ct = residual.delta_ct,
            residual_applied = residual.applied,
            "cycle complete"
        );

        self.persist_learning(persisted).await;

        Ok(CycleOutcome {
            action: final_action,
            replan_recommended,
        })
    }

    /// Feed the previous cycle's action and this cycle's realized outcome
    /// into the learning layer. Returns whether the hardware deviated from
    /// plan, when there was a previous cycle to compare against.
    fn absorb_previous_outcome(
        &self,
        learning: &mut Learning,
        state: &SystemState,
    ) -> Option<bool> {
        let pending = learning.pending.take()?;

        learning
            .reliability
            .record(ForecastSignal::Pv, state.pv.power_w, pending.forecast_pv_w);
        learning.reliability.record(
            ForecastSignal::Consumption,
            state.load.power_w,
            pending.forecast_load_w,
        );
        learning.reliability.record(
            ForecastSignal::Price,
            state.price.current_ct_kwh,
            pending.forecast_price_ct,
        );

        let realized_cost_ct = realized_cost_ct(state, self.cfg.planner.feed_in_ct_kwh);
        let error_ct = pending.predicted_cost_ct - realized_cost_ct;
        learning.seasonal.record(pending.at, error_ct);

        let deviated =
            (state.battery.power_w - pending.planned_battery_power_w).abs() > POWER_DEADBAND_W;
        if deviated {
            learning.reaction.record(error_ct.abs() < COST_DEADBAND_CT);
        }

        let Learning {
            replay, agent, ..
        } = learning;
        replay.push(ReplayExperience {
            at: pending.at,
            state: pending.state_key,
            action_index: pending.delta_index,
            reward: error_ct,
            next_state: pending.state_key,
        });
        let batch = replay.sample(self.cfg.residual.batch_size, &mut rand::thread_rng());
        agent.train(&batch);

        Some(deviated)
    }

    async fn persist_learning(
        &self,
        docs: (BufferModel, LearningState, ReplayBuffer, PlanSnapshot),
    ) {
        let store = self.docs.clone();
        let result = tokio::task::spawn_blocking(move || {
            let (buffer, learning, replay, plan) = docs;
            store.save(BUFFER_DOC, BUFFER_SCHEMA_VERSION, &buffer)?;
            store.save(RESIDUAL_DOC, RESIDUAL_SCHEMA_VERSION, &learning)?;
            store.save(REPLAY_DOC, RESIDUAL_SCHEMA_VERSION, &replay)?;
            store.save(PLAN_SNAPSHOT_DOC, PLAN_SNAPSHOT_SCHEMA_VERSION, &plan)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "learning state not persisted, retrying next cycle"),
            Err(e) => warn!(error = %e, "persistence task failed"),
        }
    }
}

/// Derive the executable action from slot 0 of the plan.
fn action_from_plan(plan: &PlanHorizon, constraints: &PlannerConstraints) -> Action {
    let Some(slot) = plan.first_slot() else {
        return Action::hold_all(constraints.floor_soc_percent, ActionSource::Planner);
    };

    let (battery_mode, battery_power_w, battery_price_limit_ct) = if slot.battery_charge_w > 0.0 {
        (
            BatteryMode::Charge,
            slot.battery_charge_w,
            Some(slot.grid_price_ct_kwh),
        )
    } else if slot.battery_discharge_w > 0.0 {
        (
            BatteryMode::Discharge,
            slot.battery_discharge_w,
            Some(slot.grid_price_ct_kwh),
        )
    } else {
        (BatteryMode::Hold, 0.0, None)
    };

    let (ev_mode, ev_power_w, ev_price_limit_ct) = if slot.ev_charge_w > 0.0 {
        (
            EvMode::Charge,
            slot.ev_charge_w,
            Some(slot.grid_price_ct_kwh),
        )
    } else {
        (EvMode::Idle, 0.0, None)
    };

    Action {
        battery_mode,
        battery_power_w,
        battery_price_limit_ct,
        ev_mode,
        ev_power_w,
        ev_price_limit_ct,
        soc_floor_percent: plan.soc_floor_percent,
        source: ActionSource::Planner,
    }
}

/// Cost of one planned slot, in cents.
fn slot_cost_ct(slot: &DispatchSlot, feed_in_ct_kwh: f64) -> f64 {
    let dt_h = SLOT_MINUTES as f64 / 60.0;
    let net_kw = (slot.load_forecast_w - slot.pv_forecast_w + slot.battery_charge_w
        + slot.ev_charge_w
        - slot.battery_discharge_w)
        / 1000.0;
    if net_kw >= 0.0 {
        slot.grid_price_ct_kwh * net_kw * dt_h
    } else {
        feed_in_ct_kwh * net_kw * dt_h
    }
}

/// Cost actually incurred this slot, from measured powers.
fn realized_cost_ct(state: &SystemState, feed_in_ct_kwh: f64) -> f64 {
    let dt_h = SLOT_MINUTES as f64 / 60.0;
    let net_kw = (state.load.power_w - state.pv.power_w + state.battery.power_w) / 1000.0;
    if net_kw >= 0.0 {
        state.price.current_ct_kwh * net_kw * dt_h
    } else {
        feed_in_ct_kwh * net_kw * dt_h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SolverStatus;

    fn test_loop(mut mutate: impl FnMut(&mut Config)) -> (Arc<DecisionLoop>, Arc<SimulatedHardware>) {
        let mut cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        cfg.persistence.data_dir = dir.path().to_path_buf();
        // Keep the directory alive for the duration of the test process.
        std::mem::forget(dir);
        mutate(&mut cfg);

        let hardware = Arc::new(SimulatedHardware::new(&cfg.battery, 50.0));
        let docs = DocumentStore::new(&cfg.persistence.data_dir).unwrap();
        let decision_loop = Arc::new(DecisionLoop::new(
            cfg,
            Arc::new(StateStore::new()),
            hardware.clone(),
            Box::new(DayNightPriceForecaster::default()),
            Box::new(ClearSkyPvForecaster::default()),
            Box::new(BaselineConsumptionForecaster::default()),
            docs,
        ));
        (decision_loop, hardware)
    }

    #[tokio::test]
    async fn cycle_publishes_plan_and_applies_action() {
        let (decision_loop, hardware) = test_loop(|_| {});
        let outcome = decision_loop.run_cycle().await.unwrap();

        let plan = decision_loop.store.plan().expect("plan published");
        let measured = hardware.read_battery().await.unwrap().soc_percent;
        assert!((plan.slots[0].battery_soc_percent - measured).abs() < 1e-6);
        assert!(decision_loop.store.action().is_some());
        assert_eq!(hardware.applied_actions(), 1);
        assert!(outcome.action.soc_floor_percent >= 20.0);

        // The solve record is persisted alongside the learned models.
        let snapshot: Option<PlanSnapshot> = decision_loop
            .docs
            .load(PLAN_SNAPSHOT_DOC, PLAN_SNAPSHOT_SCHEMA_VERSION)
            .unwrap();
        assert_eq!(snapshot.unwrap().computed_at, plan.computed_at);
    }

    #[tokio::test]
    async fn solver_timeout_falls_back_with_identical_action_shape() {
        let (decision_loop, hardware) = test_loop(|cfg| cfg.planner.solver_budget_secs = 0);
        let outcome = decision_loop.run_cycle().await.unwrap();

        assert_eq!(outcome.action.source, ActionSource::Fallback);
        let plan = decision_loop.store.plan().unwrap();
        assert_eq!(plan.status, SolverStatus::Heuristic);
        // Shape is identical: the hardware received it like any other.
        assert_eq!(hardware.applied_actions(), 1);
        assert_eq!(
            hardware.last_action().unwrap().soc_floor_percent,
            outcome.action.soc_floor_percent
        );
    }

    #[tokio::test]
    async fn observation_mode_never_calls_min_soc() {
        let (decision_loop, hardware) = test_loop(|_| {});
        for _ in 0..3 {
            decision_loop.run_cycle().await.unwrap();
            hardware.advance_slot();
        }
        assert!(hardware.min_soc_calls().is_empty());
    }

    #[tokio::test]
    async fn arbitrage_override_skips_buffer_evaluation() {
        let (decision_loop, hardware) = test_loop(|_| {});
        hardware.set_arbitrage_active(true);
        decision_loop.run_cycle().await.unwrap();

        let learning = decision_loop.learning.lock().await;
        assert!(learning.buffer.model().events.is_empty());
    }

    #[tokio::test]
    async fn feedback_reaches_learning_layer_one_cycle_later() {
        let (decision_loop, hardware) = test_loop(|_| {});
        decision_loop.run_cycle().await.unwrap();
        {
            let learning = decision_loop.learning.lock().await;
            assert!(learning.replay.is_empty());
            assert!(learning.pending.is_some());
        }

        hardware.advance_slot();
        decision_loop.run_cycle().await.unwrap();
        let learning = decision_loop.learning.lock().await;
        assert_eq!(learning.replay.len(), 1);
        assert!(learning.reliability.mae(ForecastSignal::Pv).is_some());
    }

    #[tokio::test]
    async fn activated_buffer_applies_new_floor_once() {
        // Zero-output PV keeps the reliability multiplier at 1.0 across
        // cycles, so the buffer inputs are identical every time.
        let mut cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        cfg.persistence.data_dir = dir.path().to_path_buf();
        std::mem::forget(dir);
        let hardware = Arc::new(SimulatedHardware::new(&cfg.battery, 50.0));
        hardware.set_meter(0.0, 600.0);
        let docs = DocumentStore::new(&cfg.persistence.data_dir).unwrap();
        let decision_loop = DecisionLoop::new(
            cfg,
            Arc::new(StateStore::new()),
            hardware.clone(),
            Box::new(DayNightPriceForecaster::default()),
            Box::new(ClearSkyPvForecaster {
                peak_kw: 0.0,
                confidence: 0.75,
                ..Default::default()
            }),
            Box::new(BaselineConsumptionForecaster::default()),
            docs,
        );
        decision_loop.activate_buffer_now().await;

        decision_loop.run_cycle().await.unwrap();
        // Confidence 0.75 sits above the reduction threshold, so the live
        // floor differs from the base and is pushed exactly once.
        assert_eq!(hardware.min_soc_calls().len(), 1);

        // Unchanged inputs next cycle: no second hardware call.
        decision_loop.run_cycle().await.unwrap();
        assert_eq!(hardware.min_soc_calls().len(), 1);
    }

    #[tokio::test]
    async fn residual_promotion_is_gated_by_the_audit() {
        let (decision_loop, _) = test_loop(|_| {});
        decision_loop.run_cycle().await.unwrap();
        // A fresh deployment has not served its observation window.
        assert!(decision_loop.promote_residual_agent().await.is_err());
    }

    #[tokio::test]
    async fn effective_floor_never_below_configured_minimum() {
        let (decision_loop, _) = test_loop(|_| {});
        decision_loop.run_cycle().await.unwrap();
        let plan = decision_loop.store.plan().unwrap();
        assert!(plan.soc_floor_percent >= Config::default().battery.min_soc_percent);
    }
}
