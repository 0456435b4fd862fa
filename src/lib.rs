use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod models;
pub mod scheduler;
pub mod selector;
pub mod sse;
pub mod store;

pub use db::establish_connection;

/// Shared state threaded through every axum handler: the job store (C1),
/// metrics registry (C2), backend selector (C3), dispatcher (C4), the SSE
/// fan-out registry, and the static config/model-catalog stand-in.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub store: Arc<store::JobStore>,
    pub metrics: Arc<metrics::MetricsRegistry>,
    pub selector: Arc<selector::BackendSelector>,
    pub dispatcher: Arc<dispatch::Dispatcher>,
    pub sse: Arc<sse::SseRegistry>,
    pub models: Arc<models::ModelRegistry>,
}
