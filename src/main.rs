use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use pumpwatch_engine::api::{self, AppState};
use pumpwatch_engine::bridge::EventBridge;
use pumpwatch_engine::config::BootConfig;
use pumpwatch_engine::controller::ExecutionController;
use pumpwatch_engine::logging;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let boot = BootConfig::from_env()?;
    info!(port = boot.port, database_path = %boot.database_path, "starting engine");

    let controller = Arc::new(ExecutionController::new(boot.clone()));
    let bridge = Arc::new(EventBridge::new(controller.bus(), 1024));

    let (_bridge_stop_tx, bridge_stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(bridge.clone().run(bridge_stop_rx));

    let state = AppState {
        controller: controller.clone(),
        bridge: bridge.clone(),
    };

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", boot.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
