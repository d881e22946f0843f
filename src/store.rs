//! Concurrent state hub.
//!
//! The only mutable state shared between the decision loop, background
//! forecast tasks and the API layer. Guarded by a single reentrant lock
//! held exclusively for in-memory copy operations; change callbacks fire
//! strictly after the guard is released so a slow subscriber can never
//! stall a writer or deadlock a re-entrant read. Consumers receive `Arc`
//! copies of immutable snapshots, never references into the store.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::cell::RefCell;
use std::sync::Arc;

use crate::buffer::BufferStatus;
use crate::domain::{Action, PlanHorizon, SolverStatus, SystemState};

type ChangeCallback = Arc<dyn Fn(&SystemState) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    state: Option<Arc<SystemState>>,
    plan: Option<Arc<PlanHorizon>>,
    action: Option<Action>,
    buffer: Option<BufferStatus>,
}

pub struct StateStore {
    inner: ReentrantMutex<RefCell<StoreInner>>,
    callbacks: Mutex<Vec<ChangeCallback>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(StoreInner::default())),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a change callback, invoked after every snapshot update.
    /// Callbacks run outside the store lock and may read the store.
    pub fn subscribe(&self, callback: impl Fn(&SystemState) + Send + Sync + 'static) {
        self.callbacks.lock().push(Arc::new(callback));
    }

    /// Atomically replace the current snapshot, then notify subscribers.
    pub fn update(&self, state: SystemState) {
        let state = Arc::new(state);
        {
            let guard = self.inner.lock();
            guard.borrow_mut().state = Some(state.clone());
        }
        let callbacks: Vec<ChangeCallback> = self.callbacks.lock().clone();
        for callback in callbacks {
            callback(&state);
        }
    }

    /// Atomically replace the current plan. Does not notify subscribers;
    /// consumers poll at their own cadence.
    pub fn update_plan(&self, plan: PlanHorizon) {
        let guard = self.inner.lock();
        guard.borrow_mut().plan = Some(Arc::new(plan));
    }

    pub fn set_action(&self, action: Action) {
        let guard = self.inner.lock();
        guard.borrow_mut().action = Some(action);
    }

    pub fn set_buffer_status(&self, status: BufferStatus) {
        let guard = self.inner.lock();
        guard.borrow_mut().buffer = Some(status);
    }

    pub fn snapshot(&self) -> Option<Arc<SystemState>> {
        let guard = self.inner.lock();
        let snapshot = guard.borrow().state.clone();
        snapshot
    }

    pub fn plan(&self) -> Option<Arc<PlanHorizon>> {
        let guard = self.inner.lock();
        let plan = guard.borrow().plan.clone();
        plan
    }

    pub fn action(&self) -> Option<Action> {
        let guard = self.inner.lock();
        let action = guard.borrow().action.clone();
        action
    }

    pub fn buffer_status(&self) -> Option<BufferStatus> {
        let guard = self.inner.lock();
        let buffer = guard.borrow().buffer.clone();
        buffer
    }

    /// Read-only overview for the dashboard/API layer.
    pub fn overview(&self) -> StoreOverview {
        let (state, plan, action, buffer) = {
            let guard = self.inner.lock();
            let inner = guard.borrow();
            (
                inner.state.clone(),
                inner.plan.clone(),
                inner.action.clone(),
                inner.buffer.clone(),
            )
        };
        StoreOverview {
            captured_at: state.as_ref().map(|s| s.captured_at),
            battery_soc_percent: state.as_ref().map(|s| s.battery.soc_percent),
            ev_connected: state.as_ref().is_some_and(|s| s.ev.is_some()),
            current_price_ct_kwh: state.as_ref().map(|s| s.price.current_ct_kwh),
            plan: plan.as_ref().map(|p| PlanSummary::from(p.as_ref())),
            action,
            buffer,
        }
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Published outward for polling; no external caller can mutate state
/// through this shape.
#[derive(Debug, Clone, Serialize)]
pub struct StoreOverview {
    pub captured_at: Option<DateTime<Utc>>,
    pub battery_soc_percent: Option<f64>,
    pub ev_connected: bool,
    pub current_price_ct_kwh: Option<f64>,
    pub plan: Option<PlanSummary>,
    pub action: Option<Action>,
    pub buffer: Option<BufferStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub computed_at: DateTime<Utc>,
    pub status: SolverStatus,
    pub slot_count: usize,
    pub objective_cost_ct: f64,
    pub departure_shortfall_percent: Option<f64>,
    pub soc_floor_percent: f64,
    /// A plan older than one slot; only ever informational here, the
    /// control loop never executes beyond slot 0 of a fresh solve.
    pub stale: bool,
}

impl From<&PlanHorizon> for PlanSummary {
    fn from(plan: &PlanHorizon) -> Self {
        Self {
            computed_at: plan.computed_at,
            status: plan.status,
            slot_count: plan.slots.len(),
            objective_cost_ct: plan.objective_cost_ct,
            departure_shortfall_percent: plan.departure_shortfall_percent,
            soc_floor_percent: plan.soc_floor_percent,
            stale: plan.is_stale(Utc::now()),
        }
    }
}
