use std::sync::Arc;

use jobqueue::db::establish_connection;
use jobqueue::store::JobStore;
use serde_json::json;

async fn store() -> JobStore {
    let db = establish_connection("sqlite::memory:").await.unwrap();
    JobStore::new(Arc::new(db))
}

#[tokio::test]
async fn insert_claim_complete_round_trip() {
    let store = store().await;
    let request = json!({"model": "llama3", "messages": [{"role": "user", "content": "hi"}]});
    let inserted = store
        .insert("user-1", Some("llama3"), &request, 5, 3)
        .await
        .unwrap();
    assert_eq!(inserted.status, "queued");
    assert_eq!(inserted.priority_score, 5.0);

    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, inserted.id);
    assert_eq!(claimed.status, "running");
    assert_eq!(claimed.attempt_count, 1);

    let result = json!({"choices": [{"message": {"content": "Hello"}}]});
    store.mark_completed(&claimed.id, &result).await.unwrap();

    let fetched = store.get(&claimed.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, "completed");
    let stored_result: serde_json::Value =
        serde_json::from_str(fetched.result.as_deref().unwrap()).unwrap();
    assert_eq!(stored_result, result);
}

#[tokio::test]
async fn claim_next_returns_none_when_queue_empty() {
    let store = store().await;
    assert!(store.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn claim_orders_by_priority_score_then_created_at() {
    let store = store().await;
    let request = json!({});
    let low = store.insert("u", None, &request, 1, 3).await.unwrap();
    let high = store.insert("u", None, &request, 9, 3).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, high.id);

    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, low.id);
}

#[tokio::test]
async fn retry_then_succeed_tracks_attempt_count() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u", None, &request, 5, 3).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.attempt_count, 1);
    let requeued = store
        .mark_failed(&claimed.id, "transient 500", true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(requeued.status, "queued");

    let claimed_again = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed_again.id, job.id);
    assert_eq!(claimed_again.attempt_count, 2);

    let completed = store
        .mark_completed(&claimed_again.id, &json!({"ok": true}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, "completed");
    assert_eq!(completed.attempt_count, 2);
}

#[tokio::test]
async fn retry_exhaustion_lands_in_failed() {
    let store = store().await;
    let request = json!({});
    store.insert("u", None, &request, 5, 1).await.unwrap();

    let claimed = store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.attempt_count, 1);
    let failed = store
        .mark_failed(&claimed.id, "backend unreachable", true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.status, "failed");
    assert_eq!(failed.attempt_count, 1);
    assert_eq!(failed.error.as_deref(), Some("backend unreachable"));
}

#[tokio::test]
async fn cancel_while_running_is_terminal_and_idempotent() {
    let store = store().await;
    let request = json!({});
    store.insert("u", None, &request, 5, 3).await.unwrap();
    let claimed = store.claim_next().await.unwrap().unwrap();

    let cancelled = store.mark_cancelled(&claimed.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, "cancelled");

    // Dispatcher later tries to write a terminal state for the same job —
    // mark_completed must not resurrect it out of cancelled (dispatch::Dispatcher::finish
    // guards against this by checking current status before writing).
    let again = store.mark_cancelled(&claimed.id).await.unwrap().unwrap();
    assert_eq!(again.status, "cancelled");
}

#[tokio::test]
async fn admin_retry_requires_terminal_state() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u", None, &request, 7, 3).await.unwrap();

    // Still queued — retry must fail with conflict.
    let err = store.admin_retry(&job.id).await.unwrap_err();
    assert!(matches!(err, jobqueue::error::QueueError::Conflict(_)));

    store.claim_next().await.unwrap();
    store
        .mark_failed(&job.id, "permanent failure", false)
        .await
        .unwrap();

    let retried = store.admin_retry(&job.id).await.unwrap();
    assert_eq!(retried.status, "queued");
    assert_eq!(retried.attempt_count, 0);
    assert_eq!(retried.priority_score, 7.0);
    assert!(retried.error.is_none());
}

#[tokio::test]
async fn set_backend_is_idempotent() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u", None, &request, 5, 3).await.unwrap();
    store.claim_next().await.unwrap();

    store.set_backend(&job.id, "http://backend-a:11434").await.unwrap();
    store.set_backend(&job.id, "http://backend-b:11434").await.unwrap();

    let fetched = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(fetched.backend_url.as_deref(), Some("http://backend-a:11434"));
}
