use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder, QuerySelect};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::error_response;
use crate::auth::AdminUser;
use crate::db::entities::backend_snapshot;
use crate::selector::Strategy;
use crate::AppState;

/// Admin operational endpoints over C2 (metrics) and the snapshot
/// time-series — spec.md §6 `/system/metrics`, `/system/snapshots`,
/// `/system/lb-strategy`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/snapshots", get(snapshots))
        .route("/lb-strategy", get(get_strategy).post(set_strategy))
}

async fn metrics(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    let snapshot = state.metrics.snapshot().await;
    Json(json!({ "backends": snapshot }))
}

#[derive(Deserialize)]
pub struct SnapshotsQuery {
    pub backend_url: Option<String>,
    pub limit: Option<u64>,
}

async fn snapshots(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(q): Query<SnapshotsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let mut query = backend_snapshot::Entity::find();
    if let Some(url) = &q.backend_url {
        query = query.filter(backend_snapshot::Column::BackendUrl.eq(url.clone()));
    }
    let limit = q.limit.unwrap_or(100).clamp(1, 1000);
    let rows = query
        .order_by_desc(backend_snapshot::Column::CapturedAt)
        .limit(limit)
        .all(state.store.raw_connection().as_ref())
        .await
        .map_err(|e| error_response(e.into()))?;
    Ok(Json(json!({ "snapshots": rows })))
}

async fn get_strategy(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    Json(json!({ "strategy": state.selector.strategy().await.as_str() }))
}

#[derive(Deserialize)]
pub struct SetStrategyBody {
    pub strategy: String,
}

async fn set_strategy(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(body): Json<SetStrategyBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(strategy) = Strategy::parse(&body.strategy) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown strategy '{}'", body.strategy) })),
        ));
    };
    state.selector.set_strategy(strategy).await;
    Ok(Json(json!({ "strategy": strategy.as_str() })))
}
