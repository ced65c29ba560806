//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and terminal session counts. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let manager = state.terminal.manager();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "terminal": {
            "enabled": state.config.terminal.enabled,
            "sessions": manager.count().await,
            "max_sessions": state.config.terminal.max_sessions,
            "draining": manager.is_draining(),
        },
    }))
}
