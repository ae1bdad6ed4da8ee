use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::models::{Session, SessionConfig, SessionMode, StrategyConfig};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub mode: SessionMode,
    pub symbols: Vec<String>,
    pub strategies: HashMap<String, StrategyConfig>,
    pub config: SessionConfig,
    #[serde(default)]
    pub live_api_base: Option<String>,
    #[serde(default)]
    pub live_api_key: Option<String>,
    #[serde(default)]
    pub live_api_secret: Option<String>,
    #[serde(default)]
    pub live_ws_endpoint: Option<String>,
    #[serde(default)]
    pub idempotent: bool,
}

#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session: Session,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub async fn start_session_handler(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<StartSessionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let credentials = match (
        request.live_api_base,
        request.live_api_key,
        request.live_api_secret,
        request.live_ws_endpoint,
    ) {
        (Some(api_base), Some(api_key), Some(api_secret), Some(ws_endpoint)) => {
            Some(crate::controller::LiveCredentials {
                api_base,
                api_key,
                api_secret,
                ws_endpoint,
            })
        }
        _ => None,
    };

    let result = if request.idempotent {
        state
            .controller
            .start_session_idempotent(request.mode, request.symbols, request.strategies, request.config, credentials)
            .await
    } else {
        state
            .controller
            .start_session(request.mode, request.symbols, request.strategies, request.config, credentials)
            .await
    };

    result
        .map(|session| Json(StartSessionResponse { session }))
        .map_err(|e| (StatusCode::CONFLICT, Json(ErrorResponse { error: e.to_string() })))
}

#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub stopped: bool,
}

pub async fn stop_session_handler(
    State(state): State<AppState>,
) -> Result<Json<StopSessionResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .controller
        .stop_session()
        .await
        .map(|_| Json(StopSessionResponse { stopped: true }))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: e.to_string() })))
}

#[derive(Debug, Serialize)]
pub struct ExecutionStatusResponse {
    pub status: &'static str,
    pub session: Option<Session>,
}

pub async fn execution_status_handler(State(state): State<AppState>) -> Json<ExecutionStatusResponse> {
    use crate::controller::ControllerStatus;
    let status = match state.controller.status() {
        ControllerStatus::Idle => "idle",
        ControllerStatus::Starting => "starting",
        ControllerStatus::Running => "running",
        ControllerStatus::Stopping => "stopping",
        ControllerStatus::Stopped => "stopped",
        ControllerStatus::Failed => "failed",
    };
    Json(ExecutionStatusResponse {
        status,
        session: state.controller.active_session(),
    })
}
