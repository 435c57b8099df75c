use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use super::super::AppState;
use crate::core::error::AgentvisorError;

pub async fn health_endpoint(State(state): State<AppState>) -> Json<serde_json::Value> {
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds();
    Json(serde_json::json!({
        "success": true,
        "status": "ok",
        "degraded": state.store().is_degraded(),
        "uptime_seconds": uptime,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Process records and health states. A corrupt state file is answered
/// from the last good snapshot with `degraded: true`.
pub async fn status_endpoint(State(state): State<AppState>) -> Response {
    let (snapshot, degraded) = match state.store().load().await {
        Ok(snapshot) => (snapshot, false),
        Err(e @ AgentvisorError::StateCorrupt { .. }) => match state.store().last_good() {
            Some(snapshot) => (snapshot, true),
            None => {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "success": false, "degraded": true, "error": e.to_string() })),
                )
                    .into_response();
            }
        },
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let processes: Vec<serde_json::Value> = snapshot
        .processes
        .values()
        .map(|record| {
            let mut value = serde_json::to_value(record).unwrap_or_default();
            value["alive"] = serde_json::Value::Bool(state.supervisor().is_alive(record));
            value
        })
        .collect();
    let health: Vec<_> = snapshot.health.values().collect();

    Json(serde_json::json!({
        "success": true,
        "degraded": degraded,
        "processes": processes,
        "health": health,
    }))
    .into_response()
}
