//! HTTP surface: health, session directory, per-user enumeration, and the
//! daemon RPC bridge.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use porthole_proto::{DaemonCommand, SessionSummary};
use porthole_sealing::{derive_user_id, epoch_millis};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::CommandError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: u64,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: epoch_millis(),
    })
}

#[derive(Debug, Serialize)]
pub struct DirectoryResponse {
    pub sessions: Vec<SessionSummary>,
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<DirectoryResponse> {
    Json(DirectoryResponse {
        sessions: state.broker.summaries().await,
    })
}

pub async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match state.broker.summary(&session_id).await {
        Some(summary) => Json(summary).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Session not found"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionsRequest {
    pub user_secret: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSessionsResponse {
    pub user_id: String,
    pub sessions: Vec<SessionSummary>,
}

pub async fn user_sessions(
    State(state): State<AppState>,
    Json(request): Json<UserSessionsRequest>,
) -> Json<UserSessionsResponse> {
    let user_id = derive_user_id(&request.user_secret);
    let sessions = state.broker.user_sessions(&user_id).await;
    Json(UserSessionsResponse { user_id, sessions })
}

#[derive(Debug, Deserialize)]
pub struct DaemonCommandRequest {
    pub command: DaemonCommand,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

pub async fn daemon_command(
    State(state): State<AppState>,
    Json(request): Json<DaemonCommandRequest>,
) -> Response {
    match state
        .broker
        .dispatch_command(request.command, request.params)
        .await
    {
        Ok(data) => Json(json!({"success": true, "data": data})).into_response(),
        Err(err) => {
            let status = match err {
                CommandError::NoDaemon => StatusCode::SERVICE_UNAVAILABLE,
                CommandError::Timeout => StatusCode::GATEWAY_TIMEOUT,
                // The RPC round-trip worked; the daemon said no.
                CommandError::Failed(_) => StatusCode::OK,
            };
            (status, Json(json!({"error": err.message()}))).into_response()
        }
    }
}
