use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::state::AppState;

/// GET /api/health
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.uptime_seconds(),
        "current_jobs": state.registry.active_count(),
        "queued_jobs": state.registry.queued_count(),
    }))
}

/// GET /api/capabilities
pub async fn capabilities_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!(&*state.capabilities))
}

/// GET /api/stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<Value> {
    let stats = state.registry.stats();
    Json(json!({
        "jobs": stats,
        "subscribers": state.bus.subscriber_count(),
        "dropped_events": state.bus.dropped_total(),
    }))
}

/// GET /api/status: composite view for dashboards.
pub async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let sample = state.monitor.latest();
    let decision = state
        .admission
        .decide(&sample, state.registry.active_count());
    Json(json!({
        "hardware": &*state.capabilities,
        "realtime": sample,
        "admission": decision,
        "jobs": state.registry.list(),
    }))
}
