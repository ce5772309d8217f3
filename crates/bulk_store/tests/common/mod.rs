//! Shared fixtures for the bulk store integration tests.

#![allow(dead_code)]

use bulk_store::{
    BulkDb, BulkRequest, BulkRequestStatus, RequestStore, Restriction, StoreConfig, Subject,
    TargetState,
};

pub async fn open_store() -> (BulkDb, RequestStore) {
    open_store_with(StoreConfig::default()).await
}

pub async fn open_store_with(config: StoreConfig) -> (BulkDb, RequestStore) {
    let db = BulkDb::open_in_memory().await.unwrap();
    let store = RequestStore::new(&db, &config).unwrap();
    (db, store)
}

pub fn owner() -> Subject {
    Subject::new(1000, 100)
}

pub fn paths(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

pub async fn submit(store: &RequestStore, request: BulkRequest, targets: &[&str]) -> BulkRequest {
    store
        .store(&owner(), &Restriction::None, request, &paths(targets))
        .await
        .unwrap()
}

pub async fn submit_pin(store: &RequestStore, targets: &[&str]) -> BulkRequest {
    submit(store, BulkRequest::new("PIN"), targets).await
}

/// Move every non-root target of the request to `state`.
pub async fn finish_targets(store: &RequestStore, request: &BulkRequest, state: TargetState) {
    let targets = store.targets().page(request.seq_no, 0, 10_000).await.unwrap();
    for target in targets {
        store
            .targets()
            .update_state(target.id, state, None)
            .await
            .unwrap();
    }
}

/// Drive a request through STARTED to COMPLETED.
pub async fn complete(store: &RequestStore, request: &BulkRequest) {
    let uid = request.uid.as_str();
    assert!(store.update(uid, BulkRequestStatus::Started).await.unwrap());
    finish_targets(store, request, TargetState::Completed).await;
    assert!(store.update(uid, BulkRequestStatus::Completed).await.unwrap());
}

/// Status as persisted, bypassing the cache.
pub async fn persisted_status(db: &BulkDb, uid: &str) -> Option<(String, Option<i64>)> {
    sqlx::query_as::<_, (String, Option<i64>)>(
        "SELECT status, completed_at FROM bulk_request WHERE uid = ?",
    )
    .bind(uid)
    .fetch_optional(db.pool())
    .await
    .unwrap()
}
