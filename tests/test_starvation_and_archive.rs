use std::sync::Arc;

use jobqueue::db::establish_connection;
use jobqueue::store::JobStore;
use serde_json::json;

async fn store() -> JobStore {
    let db = establish_connection("sqlite::memory:").await.unwrap();
    JobStore::new(Arc::new(db))
}

#[tokio::test]
async fn bump_stale_scores_only_touches_queued_rows() {
    let store = store().await;
    let request = json!({});
    let queued = store.insert("u", None, &request, 5, 3).await.unwrap();
    let running = store.insert("u", None, &request, 5, 3).await.unwrap();
    store.claim_next().await.unwrap(); // claims whichever sorts first; both are priority 5

    let n = store.bump_stale_scores(0.5).await.unwrap();
    assert_eq!(n, 1);

    let queued_after = store.get(&queued.id).await.unwrap().unwrap();
    let running_after = store.get(&running.id).await.unwrap().unwrap();
    // Exactly one of the two rows is still queued; it must have been bumped.
    // The other (claimed into `running`) must be untouched.
    let bumped = [&queued_after, &running_after]
        .into_iter()
        .filter(|j| j.status == "queued")
        .all(|j| j.priority_score == 5.5);
    assert!(bumped);
    let running_untouched = [&queued_after, &running_after]
        .into_iter()
        .filter(|j| j.status == "running")
        .all(|j| j.priority_score == 5.0);
    assert!(running_untouched);
}

#[tokio::test]
async fn starvation_bump_boundary_matches_spec_example() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u", None, &request, 10, 3).await.unwrap();
    assert_eq!(job.priority_score, 10.0);

    store.bump_stale_scores(0.5).await.unwrap();
    let after = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(after.priority_score, 10.5);
}

#[tokio::test]
async fn archive_old_moves_aged_terminal_rows() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u", None, &request, 5, 3).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_completed(&job.id, &json!({"ok": true})).await.unwrap();

    // archive_old(0) treats "now" as the cutoff (epoch-second granularity),
    // so the row needs to age past the current second before it qualifies.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let archived = store.archive_old(0).await;
    assert_eq!(archived, 1);
    assert!(store.get(&job.id).await.unwrap().is_none());

    let filters = jobqueue::store::AdminJobFilters::default();
    let (rows, total) = store.list_archived(&filters, 0, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].id, job.id);
    assert_eq!(rows[0].status, "completed");
}

#[tokio::test]
async fn purge_archive_zero_is_a_noop() {
    let store = store().await;
    let request = json!({});
    let job = store.insert("u", None, &request, 5, 3).await.unwrap();
    store.claim_next().await.unwrap();
    store.mark_completed(&job.id, &json!({})).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    store.archive_old(0).await;

    let purged = store.purge_archive(0).await;
    assert_eq!(purged, 0);

    let filters = jobqueue::store::AdminJobFilters::default();
    let (_, total) = store.list_archived(&filters, 0, 10).await.unwrap();
    assert_eq!(total, 1);
}
