//! Archiving, clearing, abort and restart recovery.

mod common;

use std::io;
use std::time::Duration;

use bulk_store::{
    ArchivedRequestInfo, ArchivedSummaryFilter, BulkDb, BulkRequest, BulkRequestStatus, Criterion,
    LeadershipListener, NewTarget, RequestArchiver, RequestStore, Subject, SweepReport,
    TargetPid, TargetState,
};
use common::*;

fn archiver(store: &RequestStore) -> RequestArchiver {
    RequestArchiver::new(
        store.clone(),
        Duration::from_secs(60),
        Duration::from_secs(3600),
    )
}

async fn backdate(db: &BulkDb, uid: &str) {
    sqlx::query("UPDATE bulk_request SET last_modified = 0 WHERE uid = ?")
        .bind(uid)
        .execute(db.pool())
        .await
        .unwrap();
}

async fn completed(store: &RequestStore, targets: &[&str]) -> BulkRequest {
    let request = submit_pin(store, targets).await;
    complete(store, &request).await;
    request
}

#[tokio::test]
async fn test_sweep_keeps_requests_that_fail_to_archive() {
    let (db, store) = open_store().await;
    let a = completed(&store, &["/a"]).await;
    let k = completed(&store, &["/k"]).await;
    let b = completed(&store, &["/b"]).await;
    for request in [&a, &k, &b] {
        backdate(&db, request.uid.as_str()).await;
    }

    // An archive row already exists for K, so archiving it again fails
    store
        .archive()
        .insert(&ArchivedRequestInfo::from_request(&k))
        .await
        .unwrap();

    let archiver = archiver(&store);
    archiver.is_leader();
    let report = archiver.run_now().await.unwrap().unwrap();
    assert_eq!(
        report,
        SweepReport {
            archived: 2,
            failed: vec![k.uid.to_string()],
            deleted: 2,
        }
    );

    assert!(persisted_status(&db, a.uid.as_str()).await.is_none());
    assert!(persisted_status(&db, b.uid.as_str()).await.is_none());
    assert!(persisted_status(&db, k.uid.as_str()).await.is_some());

    let archived = store
        .get_archived_info(&owner(), a.uid.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(archived.status, BulkRequestStatus::Completed);
    assert_eq!(archived.targets.len(), 1);
    assert_eq!(archived.targets[0].target, "/a");

    store
        .archive()
        .delete(&Criterion::archive().uids([k.uid.as_str()]))
        .await
        .unwrap();
    let report = archiver.run_now().await.unwrap().unwrap();
    assert_eq!(report.archived, 1);
    assert!(report.failed.is_empty());
    assert_eq!(report.deleted, 1);
    assert!(persisted_status(&db, k.uid.as_str()).await.is_none());
}

#[tokio::test]
async fn test_sweep_skips_recent_and_active_requests() {
    let (db, store) = open_store().await;
    let recent = completed(&store, &["/recent"]).await;
    let running = submit_pin(&store, &["/running"]).await;
    store
        .update(running.uid.as_str(), BulkRequestStatus::Started)
        .await
        .unwrap();
    backdate(&db, running.uid.as_str()).await;

    let archiver = archiver(&store);
    archiver.is_leader();
    let report = archiver.run_now().await.unwrap().unwrap();
    assert_eq!(report, SweepReport::default());

    assert!(persisted_status(&db, recent.uid.as_str()).await.is_some());
    assert!(persisted_status(&db, running.uid.as_str()).await.is_some());
}

#[tokio::test]
async fn test_scheduled_sweep_needs_leadership() {
    let (db, store) = open_store().await;
    let request = completed(&store, &["/a"]).await;
    backdate(&db, request.uid.as_str()).await;

    let archiver = archiver(&store);
    assert_eq!(archiver.run().await.unwrap(), SweepReport::default());
    assert!(persisted_status(&db, request.uid.as_str()).await.is_some());

    archiver.is_leader();
    assert_eq!(archiver.run().await.unwrap().deleted, 1);

    archiver.not_leader();
    assert_eq!(archiver.run_now().await.unwrap(), None);
}

#[tokio::test]
async fn test_archived_info_and_summaries() {
    let (_db, store) = open_store().await;
    let mine = completed(&store, &["/a"]).await;
    let theirs = store
        .store(
            &Subject::new(2000, 200),
            &bulk_store::Restriction::None,
            BulkRequest::new("DELETE"),
            &paths(&["/b"]),
        )
        .await
        .unwrap();

    store.clear(&owner(), mine.uid.as_str()).await.unwrap();
    store
        .clear(&Subject::root(), theirs.uid.as_str())
        .await
        .unwrap();

    let err = store
        .get_archived_info(&Subject::new(2000, 200), mine.uid.as_str())
        .await
        .unwrap_err();
    assert!(err.is_permission_denied());
    assert!(store
        .get_archived_info(&Subject::root(), mine.uid.as_str())
        .await
        .unwrap()
        .is_some());
    assert!(store
        .get_archived_info(&owner(), "0b0e0c4a-1111-4000-8000-000000000000")
        .await
        .unwrap()
        .is_none());

    let all = store
        .get_archived_summaries(&ArchivedSummaryFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let filter = ArchivedSummaryFilter {
        owners: vec!["2000:200".to_string()],
        ..Default::default()
    };
    let summaries = store.get_archived_summaries(&filter).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].uid, theirs.uid.to_string());
    assert_eq!(summaries[0].activity, "DELETE");
    assert_eq!(summaries[0].status, BulkRequestStatus::Queued);
}

#[tokio::test]
async fn test_clear_archives_before_deleting() {
    let (db, store) = open_store().await;
    let request = submit_pin(&store, &["/a", "/b"]).await;
    let uid = request.uid.as_str();

    store.clear(&owner(), uid).await.unwrap();

    assert!(store.get_request(uid).await.unwrap().is_none());
    assert!(persisted_status(&db, uid).await.is_none());
    assert!(store.targets().rids_of("/a").await.unwrap().is_empty());

    let archived = store.get_archived_info(&owner(), uid).await.unwrap().unwrap();
    assert_eq!(archived.targets.len(), 2);

    let err = store.clear(&owner(), uid).await.unwrap_err();
    assert!(err.is_permission_denied());
    store.clear_unchecked(uid).await.unwrap();
}

#[tokio::test]
async fn test_clear_keeps_request_when_archiving_fails() {
    let (db, store) = open_store().await;
    let request = completed(&store, &["/a"]).await;
    let uid = request.uid.as_str();

    store
        .archive()
        .insert(&ArchivedRequestInfo::from_request(&request))
        .await
        .unwrap();

    let err = store.clear(&owner(), uid).await.unwrap_err();
    assert!(!err.is_not_found());
    assert!(store.clear_unchecked(uid).await.is_err());

    assert!(persisted_status(&db, uid).await.is_some());
    assert!(store.get_request(uid).await.unwrap().is_some());
    assert_eq!(store.targets().rids_of("/a").await.unwrap(), vec![request.seq_no]);
}

#[tokio::test]
async fn test_clear_when_terminated_waits_for_completion() {
    let (_db, store) = open_store().await;
    let request = submit_pin(&store, &["/a"]).await;
    let uid = request.uid.as_str();

    store.clear_when_terminated(&owner(), uid).await.unwrap();
    let flagged = store.get_request(uid).await.unwrap().unwrap();
    assert!(flagged.clear_on_success);
    assert!(flagged.clear_on_failure);
    assert_eq!(flagged.delay_clear, 0);

    complete(&store, &request).await;
    assert!(store.get_request(uid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_clear_when_terminated_clears_finished_request_now() {
    let (_db, store) = open_store().await;
    let request = completed(&store, &["/a"]).await;
    let uid = request.uid.as_str();

    let err = store
        .clear_when_terminated(&Subject::new(5, 5), uid)
        .await
        .unwrap_err();
    assert!(err.is_permission_denied());

    store.clear_when_terminated(&owner(), uid).await.unwrap();
    assert!(store.get_request(uid).await.unwrap().is_none());
}

#[derive(Debug, thiserror::Error)]
#[error("could not expand directory")]
struct ExpansionError(#[source] io::Error);

#[tokio::test]
async fn test_abort_records_root_cause() {
    let (_db, store) = open_store().await;
    let mut request = BulkRequest::new("PIN");
    request.target_prefix = Some("/data".to_string());
    let request = submit(&store, request, &["a"]).await;
    let uid = request.uid.as_str();

    let error = ExpansionError(io::Error::other("namespace unavailable"));
    store.abort(&request, "Abort", &error).await.unwrap();

    assert_eq!(
        store.get_request_status(uid).await.unwrap(),
        Some(BulkRequestStatus::Completed)
    );
    assert_eq!(store.targets().count_failed(request.seq_no).await.unwrap(), 1);

    let root = store
        .targets()
        .get(
            &Criterion::targets()
                .rid(request.seq_no)
                .pids(&[TargetPid::Root]),
            None,
        )
        .await
        .unwrap();
    assert_eq!(root.len(), 1);
    assert_eq!(root[0].path, "/data");
    assert_eq!(root[0].state, TargetState::Failed);
    assert_eq!(root[0].error_type.as_deref(), Some("Abort"));
    assert_eq!(root[0].error_message.as_deref(), Some("namespace unavailable"));

    let info = store.get_request_info(&owner(), uid, 0).await.unwrap();
    assert_eq!(info.targets.len(), 1);
    assert!(info.targets[0].initial);
}

#[tokio::test]
async fn test_abort_honours_clear_on_failure() {
    let (_db, store) = open_store().await;
    let mut request = BulkRequest::new("PIN");
    request.clear_on_failure = true;
    let request = submit(&store, request, &["/a"]).await;

    let error = io::Error::other("boom");
    store.abort(&request, "Abort", &error).await.unwrap();
    assert!(store
        .get_request(request.uid.as_str())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_reset_returns_request_to_queue() {
    let (_db, store) = open_store().await;
    let request = submit_pin(&store, &["/dir"]).await;
    let uid = request.uid.as_str();
    store.update(uid, BulkRequestStatus::Started).await.unwrap();

    store
        .targets()
        .insert(&NewTarget::discovered(request.seq_no, "/dir/f1"))
        .await
        .unwrap();
    finish_targets(&store, &request, TargetState::Completed).await;

    store.reset(uid).await.unwrap();

    assert_eq!(
        store.get_request_status(uid).await.unwrap(),
        Some(BulkRequestStatus::Queued)
    );
    let targets = store.targets().page(request.seq_no, 0, 10).await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].pid, TargetPid::Initial);
    assert_eq!(targets[0].state, TargetState::Created);
    assert!(store.get_active_requests_by_user().is_empty());
}

#[tokio::test]
async fn test_load_requeues_interrupted_requests() {
    let (_db, store) = open_store().await;
    let started = submit_pin(&store, &["/s"]).await;
    let cancelling = submit_pin(&store, &["/c"]).await;
    let done = completed(&store, &["/d"]).await;

    store
        .update(started.uid.as_str(), BulkRequestStatus::Started)
        .await
        .unwrap();
    store
        .update(cancelling.uid.as_str(), BulkRequestStatus::Started)
        .await
        .unwrap();
    store
        .update(cancelling.uid.as_str(), BulkRequestStatus::Cancelling)
        .await
        .unwrap();

    let running = store
        .targets()
        .insert(&NewTarget::discovered(started.seq_no, "/s/f1"))
        .await
        .unwrap();
    store
        .targets()
        .update_state(running, TargetState::Running, None)
        .await
        .unwrap();
    let initial = store.targets().initial_targets(started.seq_no).await.unwrap();
    store
        .targets()
        .update_state(initial[0].id, TargetState::Running, None)
        .await
        .unwrap();

    store.load().await.unwrap();

    for request in [&started, &cancelling] {
        assert_eq!(
            store.get_request_status(request.uid.as_str()).await.unwrap(),
            Some(BulkRequestStatus::Queued)
        );
    }
    assert_eq!(
        store.get_request_status(done.uid.as_str()).await.unwrap(),
        Some(BulkRequestStatus::Completed)
    );

    let targets = store.targets().page(started.seq_no, 0, 10).await.unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].state, TargetState::Created);
    assert!(store.get_active_requests_by_user().is_empty());
    assert_eq!(store.count_active().await.unwrap(), 0);
}
