pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::bridge::EventBridge;
use crate::controller::ExecutionController;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ExecutionController>,
    pub bridge: Arc<EventBridge>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sessions/start", post(routes::start_session_handler))
        .route("/sessions/stop", post(routes::stop_session_handler))
        .route("/sessions/execution-status", get(routes::execution_status_handler))
        .route("/ws", get(ws::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
