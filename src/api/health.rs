//! Connectivity and health probes.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde_json::json;

use super::AppState;

/// Battery capacity pseudo-files, in probe order. The first is a bind mount
/// used by the containerized deployment.
const BATTERY_PATHS: [&str; 3] = [
    "/host_power/BAT0/capacity",
    "/sys/class/power_supply/BAT0/capacity",
    "/sys/class/power_supply/BAT1/capacity",
];

pub async fn root() -> impl IntoResponse {
    Json(json!({
        "system": "Nebula",
        "status": "online",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn ping() -> impl IntoResponse {
    Json(json!({ "status": "online", "message": "Pong" }))
}

/// Health summary: catalog and broker reachability, plus a best-effort
/// battery reading on hosts that have one (the reference deployment runs on
/// a laptop).
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.catalog.ping().await {
        Ok(()) => "connected",
        Err(_) => "error",
    };
    let worker = match state.queue.ping().await {
        Ok(()) => "ready",
        Err(_) => "unreachable",
    };
    let status = if database == "connected" && worker == "ready" {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "timestamp": Utc::now(),
        "database": database,
        "worker": worker,
        "battery": battery_level(),
    }))
}

fn battery_level() -> Option<String> {
    for path in BATTERY_PATHS {
        if let Ok(raw) = std::fs::read_to_string(path) {
            return Some(format!("{}%", raw.trim()));
        }
    }
    None
}
