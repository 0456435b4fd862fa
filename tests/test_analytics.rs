use std::sync::Arc;

use jobqueue::db::establish_connection;
use jobqueue::store::JobStore;
use serde_json::json;

async fn store() -> JobStore {
    let db = establish_connection("sqlite::memory:").await.unwrap();
    JobStore::new(Arc::new(db))
}

#[tokio::test]
async fn job_analytics_active_only_excludes_archive() {
    let store = store().await;
    let request = json!({});

    let completed = store.insert("u1", Some("llama3"), &request, 5, 3).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_completed(&completed.id, &json!({})).await.unwrap();

    let failed = store.insert("u1", Some("llama3"), &request, 5, 1).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_failed(&failed.id, "boom", true).await.unwrap();

    store.insert("u2", Some("mistral"), &request, 5, 3).await.unwrap();

    let analytics = store.job_analytics().await.unwrap();
    assert_eq!(analytics.total, 3);
    assert_eq!(analytics.by_status.get("completed"), Some(&1));
    assert_eq!(analytics.by_status.get("failed"), Some(&1));
    assert_eq!(analytics.by_status.get("queued"), Some(&1));
    assert!(!analytics.includes_archive);

    let llama = analytics
        .by_model
        .iter()
        .find(|m| m.model_id == "llama3")
        .unwrap();
    assert_eq!(llama.total, 2);
    assert_eq!(llama.completed, 1);
    assert_eq!(llama.failed, 1);

    // Archiving the completed/failed rows must not change active-only totals.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    store.archive_old(0).await;
    let after_archive = store.job_analytics().await.unwrap();
    assert_eq!(after_archive.total, 1);
}

#[tokio::test]
async fn combined_analytics_includes_archived_rows() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u1", Some("llama3"), &request, 5, 3).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_completed(&job.id, &json!({})).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    store.archive_old(0).await;

    let active_only = store.job_analytics().await.unwrap();
    assert_eq!(active_only.total, 0);

    let combined = store.combined_analytics().await.unwrap();
    assert_eq!(combined.total, 1);
    assert!(combined.includes_archive);
}

#[tokio::test]
async fn avg_wait_seconds_reflects_completed_jobs_only() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u1", None, &request, 5, 3).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_completed(&job.id, &json!({})).await.unwrap();

    let analytics = store.job_analytics().await.unwrap();
    // created_at == updated_at within the same second in this fast test run.
    assert!(analytics.avg_wait_seconds >= 0.0);
}
