pub mod error;
pub mod response;
pub mod status;

use axum::{routing::get, Router};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{config::Config, controller::AppState};

/// Read-only dashboard surface. No route mutates state.
pub fn router(state: AppState, cfg: &Config) -> Router {
    let mut router = Router::new()
        .route("/api/v1/status", get(status::get_status))
        .route("/api/v1/plan", get(status::get_plan))
        .route("/api/v1/buffer", get(status::get_buffer))
        .with_state(state);

    if cfg.server.enable_cors {
        router = router.layer(tower_http::cors::CorsLayer::permissive());
    }

    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(Duration::from_secs(
                cfg.server.request_timeout_secs,
            ))),
    )
}
