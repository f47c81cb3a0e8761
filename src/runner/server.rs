//! Runner-local HTTP server: liveness and a view of the current state.

use std::sync::Arc;

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};

use super::control::Runner;

/// Build the runner's local router.
pub fn runner_routes(runner: Arc<Runner>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/state", get(current_state))
        .with_state(runner)
}

async fn healthz(State(runner): State<Arc<Runner>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "runner_id": runner.config().runner_id,
        "phase": runner.phase(),
    }))
}

async fn current_state(State(runner): State<Arc<Runner>>) -> impl IntoResponse {
    Json(runner.state().await)
}
