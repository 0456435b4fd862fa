use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};

use crate::auth::AdminUser;
use crate::AppState;

/// Raw C2 readouts in the shape the original's `routers/ollama.py`
/// surfaced to its own admin dashboard (spec.md §6
/// `/ollama/api/load-stats`, `/server-stats`).
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/load-stats", get(load_stats))
        .route("/server-stats", get(server_stats))
}

async fn load_stats(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    let snapshot = state.metrics.snapshot().await;
    Json(json!({ "backends": snapshot }))
}

async fn server_stats(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    let strategy = state.selector.strategy().await.as_str();
    let backends: Vec<Value> = state
        .config
        .backends
        .iter()
        .map(|b| json!({ "id": b.id, "url": b.url, "enabled": b.enabled }))
        .collect();
    Json(json!({
        "strategy": strategy,
        "backends": backends,
        "max_concurrent_jobs": state.config.max_concurrent_jobs,
    }))
}
