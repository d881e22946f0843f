use axum::{extract::State, Json};

use crate::{
    api::{error::ApiError, response::ApiResponse},
    buffer::BufferStatus,
    controller::AppState,
    domain::PlanHorizon,
    store::StoreOverview,
};

/// GET /api/v1/status - current snapshot, plan summary, action and buffer
/// state in one poll.
pub async fn get_status(
    State(state): State<AppState>,
) -> Json<ApiResponse<StoreOverview>> {
    Json(ApiResponse::success(state.store.overview()))
}

/// GET /api/v1/plan - the full dispatch plan of the latest cycle.
pub async fn get_plan(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<PlanHorizon>>, ApiError> {
    let plan = state.store.plan().ok_or(ApiError::NotReady("plan"))?;
    Ok(Json(ApiResponse::success(plan.as_ref().clone())))
}

/// GET /api/v1/buffer - dynamic-buffer mode and latest evaluation.
pub async fn get_buffer(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<BufferStatus>>, ApiError> {
    let status = state
        .store
        .buffer_status()
        .ok_or(ApiError::NotReady("buffer state"))?;
    Ok(Json(ApiResponse::success(status)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn app_state() -> AppState {
        let mut cfg = Config::default();
        let dir = tempfile::tempdir().unwrap();
        cfg.persistence.data_dir = dir.path().to_path_buf();
        std::mem::forget(dir);
        AppState::new(cfg).await.unwrap()
    }

    #[tokio::test]
    async fn status_is_available_before_first_cycle() {
        let state = app_state().await;
        let Json(response) = get_status(State(state)).await;
        assert!(response.success);
        assert!(response.data.unwrap().captured_at.is_none());
    }

    #[tokio::test]
    async fn plan_endpoint_reports_not_ready_then_serves_plan() {
        let state = app_state().await;
        assert!(get_plan(State(state.clone())).await.is_err());

        state.decision_loop.run_cycle().await.unwrap();
        let Json(response) = get_plan(State(state)).await.unwrap();
        assert!(!response.data.unwrap().slots.is_empty());
    }
}
