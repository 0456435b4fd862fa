use std::sync::Arc;

use jobqueue::db::establish_connection;
use jobqueue::dispatch::{ChatClient, Dispatcher};
use jobqueue::metrics::MetricsRegistry;
use jobqueue::sse::SseRegistry;
use jobqueue::store::JobStore;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn harness() -> (Arc<JobStore>, Arc<MetricsRegistry>, Arc<Dispatcher>) {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let store = Arc::new(JobStore::new(db));
    let metrics = Arc::new(MetricsRegistry::new(20, 10_000.0));
    let sse = Arc::new(SseRegistry::new());
    let client = Arc::new(ChatClient::new());
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), metrics.clone(), sse, client));
    (store, metrics, dispatcher)
}

#[tokio::test]
async fn happy_path_records_completion_and_tokens_per_second() {
    let (store, metrics, dispatcher) = harness().await;
    let backend = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "Hello"}}],
            "eval_count": 10,
            "eval_duration": 1_000_000_000i64,
        })))
        .mount(&backend)
        .await;

    let request = json!({"model": "llama3", "messages": [{"role": "user", "content": "Hi"}]});
    let job = store.insert("user-1", Some("llama3"), &request, 5, 3).await.unwrap();
    let claimed = store.claim_next().await.unwrap().unwrap();

    dispatcher.dispatch(claimed, &backend.uri()).await;

    let finished = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(finished.status, "completed");
    let result: serde_json::Value = serde_json::from_str(finished.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["choices"][0]["message"]["content"], "Hello");

    let backend_metrics = metrics.get(&backend.uri()).await.unwrap();
    assert_eq!(backend_metrics.avg_tokens_per_second, Some(10.0));
    // The dispatch decrements active_jobs exactly once on completion.
    assert_eq!(backend_metrics.active_jobs, 0);
}

#[tokio::test]
async fn backend_error_marks_job_failed_and_requeues_under_attempt_cap() {
    let (store, _metrics, dispatcher) = harness().await;
    let backend = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&backend)
        .await;

    let request = json!({"model": "llama3", "messages": []});
    let job = store.insert("user-1", Some("llama3"), &request, 5, 3).await.unwrap();
    let claimed = store.claim_next().await.unwrap().unwrap();

    dispatcher.dispatch(claimed, &backend.uri()).await;

    let after = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(after.status, "queued");
    assert_eq!(after.attempt_count, 1);
    assert!(after.error.is_some());
}

#[tokio::test]
async fn active_jobs_counter_balances_after_dispatch() {
    let (store, metrics, dispatcher) = harness().await;
    let backend = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "ok"}}],
        })))
        .mount(&backend)
        .await;

    let request = json!({"model": "llama3", "messages": []});
    store.insert("user-1", Some("llama3"), &request, 5, 3).await.unwrap();
    let claimed = store.claim_next().await.unwrap().unwrap();

    let before = metrics.get(&backend.uri()).await.map(|m| m.active_jobs).unwrap_or(0);
    dispatcher.dispatch(claimed, &backend.uri()).await;
    let after = metrics.get(&backend.uri()).await.map(|m| m.active_jobs).unwrap_or(0);
    assert_eq!(before, after);
}
