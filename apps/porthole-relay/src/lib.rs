//! Porthole relay: session directory, envelope routing, control-lock
//! arbitration, and the daemon RPC bridge.

pub mod config;
pub mod handlers;
pub mod state;
pub mod websocket;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{
    daemon_command, health_check, list_sessions, session_detail, user_sessions,
};
use crate::state::Broker;
use crate::websocket::websocket_handler;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

/// The full relay router: HTTP API plus the `/ws` endpoint.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:session_id", get(session_detail))
        .route("/api/user/sessions", post(user_sessions))
        .route("/api/daemon/command", post(daemon_command))
        .route("/ws", get(websocket_handler))
        .with_state(state)
}
