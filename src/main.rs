use anyhow::Result;
use axum::Router;
use predictive_energy_controller::{api, config::Config, controller, telemetry};
use telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;
    let app_state = controller::AppState::new(cfg.clone()).await?;
    let app: Router = api::router(app_state.clone(), &cfg);

    let addr = cfg.server.socket_addr()?;
    if cfg.server.host == "0.0.0.0" {
        warn!(
            "server binding to 0.0.0.0 - the read-only API will be reachable from the network; \
            bind to 127.0.0.1 unless behind a reverse proxy"
        );
    }

    info!(%addr, "starting predictive energy controller");

    let token = CancellationToken::new();
    controller::spawn_controller_tasks(app_state, token.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            telemetry::shutdown_signal().await;
            token.cancel();
        })
        .await?;

    warn!("shutdown complete");
    Ok(())
}
