use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use jobqueue::config::Config;
use jobqueue::db::establish_connection;
use jobqueue::dispatch::{ChatClient, Dispatcher};
use jobqueue::metrics::MetricsRegistry;
use jobqueue::models::ModelRegistry;
use jobqueue::scheduler::Scheduler;
use jobqueue::selector::BackendSelector;
use jobqueue::sse::SseRegistry;
use jobqueue::store::JobStore;
use jobqueue::{api, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    tracing::info!(port = config.port, "starting job queue");

    let db = establish_connection(&config.database_url).await?;
    let db = Arc::new(db);

    let config = Arc::new(config);
    let store = Arc::new(JobStore::new(db.clone()));
    let metrics = Arc::new(MetricsRegistry::new(
        config.ollama_alert_active_jobs_threshold,
        config.ollama_alert_response_time_threshold_ms,
    ));
    let selector = Arc::new(BackendSelector::new(&config, metrics.clone()));
    let sse = Arc::new(SseRegistry::new());
    let chat_client = Arc::new(ChatClient::new());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        metrics.clone(),
        sse.clone(),
        chat_client,
    ));
    let models = Arc::new(ModelRegistry::new(&config));

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        metrics.clone(),
        selector.clone(),
        dispatcher.clone(),
        config.clone(),
    ));
    let _maintenance_handles = scheduler.start();
    tracing::info!("scheduler maintenance loops started (dispatch, starvation, archive, snapshot, health)");

    let port = config.port;
    let state = AppState {
        config,
        store,
        metrics,
        selector,
        dispatcher,
        sse,
        models,
    };

    let cors = CorsLayer::new()
        .allow_origin([
            format!("http://localhost:{port}").parse().unwrap(),
            format!("http://127.0.0.1:{port}").parse().unwrap(),
        ])
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ])
        .allow_credentials(true);

    let app = api::create_router().layer(cors).with_state(state);

    let listener = TcpListener::bind(&format!("0.0.0.0:{port}")).await?;
    tracing::info!("job queue server listening on http://0.0.0.0:{port}");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("received shutdown signal");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("application shutdown complete");
    Ok(())
}
