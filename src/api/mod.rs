pub mod health;
pub mod jobs;
pub mod ollama;
pub mod system;

use axum::{http::StatusCode, response::Json, Router};
use serde_json::{json, Value};

use crate::error::QueueError;
use crate::AppState;

pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .nest("/jobs", jobs::routes())
        .nest("/system", system::routes())
        .nest("/ollama", ollama::routes())
}

/// Maps `QueueError` to an HTTP status: client-facing kinds get their own
/// code, everything else logs and collapses to 500 (spec.md §7).
pub(crate) fn error_response(e: QueueError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::Forbidden(_) => StatusCode::FORBIDDEN,
        QueueError::Conflict(_) => StatusCode::CONFLICT,
        QueueError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!("request failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": e.to_string() })))
}

pub(crate) fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": format!("{what} not found") })))
}

pub(crate) fn forbidden(what: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": format!("caller is not the owner of this {what}") })),
    )
}
