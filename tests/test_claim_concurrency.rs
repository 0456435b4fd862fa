use std::collections::HashSet;
use std::sync::Arc;

use jobqueue::db::establish_connection;
use jobqueue::store::JobStore;
use serde_json::json;

#[tokio::test]
async fn concurrent_claims_never_return_the_same_job_twice() {
    let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
    let store = Arc::new(JobStore::new(db));

    let request = json!({});
    for _ in 0..20 {
        store.insert("u", None, &request, 5, 3).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim_next().await.unwrap() }));
    }

    let mut claimed_ids = HashSet::new();
    let mut claimed_count = 0;
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed_count += 1;
            assert!(claimed_ids.insert(job.id), "claim_next returned the same job to two callers");
        }
    }
    assert_eq!(claimed_count, 20);
}
