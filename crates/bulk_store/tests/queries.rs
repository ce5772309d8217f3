//! Listings, request info paging and permission checks.

mod common;

use std::collections::HashMap;

use bulk_store::{
    BulkError, BulkRequest, BulkRequestFilter, BulkRequestStatus, NewTarget, Restriction,
    StoreConfig, Subject, TargetState, NO_FURTHER_ENTRIES,
};
use common::*;

#[tokio::test]
async fn test_arguments_round_trip() {
    let (_db, store) = open_store().await;
    let arguments = HashMap::from([
        ("a".to_string(), "1".to_string()),
        ("b".to_string(), "2".to_string()),
    ]);
    let mut request = BulkRequest::new("PIN");
    request.arguments = Some(arguments.clone());
    let request = submit(&store, request, &["/data/a"]).await;

    let queued = store.next(None, None, 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].arguments.as_ref(), Some(&arguments));

    let cached = store
        .get_request(request.uid.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.arguments, Some(arguments));
}

#[tokio::test]
async fn test_store_assigns_owner_and_sequence() {
    let (_db, store) = open_store().await;
    let first = submit_pin(&store, &["/data/a"]).await;
    let second = submit_pin(&store, &[]).await;

    assert!(second.seq_no > first.seq_no);
    assert_eq!(first.owner(), "1000:100");
    assert_eq!(first.status(), BulkRequestStatus::Queued);
    assert_eq!(store.get_key(first.uid.as_str()).await.unwrap(), first.seq_no);
    assert!(store
        .get_key("0b0e0c4a-1111-4000-8000-000000000000")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_duplicate_uid_is_rejected_atomically() {
    let (_db, store) = open_store().await;
    let request = submit_pin(&store, &["/data/a"]).await;

    let mut duplicate = BulkRequest::new("PIN");
    duplicate.uid = request.uid.clone();
    let err = store
        .store(&owner(), &Restriction::None, duplicate, &paths(&["/data/b"]))
        .await
        .unwrap_err();
    assert!(matches!(err, BulkError::Storage(_)));
    assert!(store.targets().rids_of("/data/b").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_next_returns_queued_in_chosen_order() {
    let (_db, store) = open_store().await;
    let a = submit_pin(&store, &["/a"]).await;
    let b = submit_pin(&store, &["/b"]).await;
    let c = submit_pin(&store, &["/c"]).await;
    store
        .update(b.uid.as_str(), BulkRequestStatus::Started)
        .await
        .unwrap();

    let forward = store.next(Some("seq_no"), None, 10).await.unwrap();
    let uids: Vec<_> = forward.iter().map(|r| r.uid.clone()).collect();
    assert_eq!(uids, vec![a.uid.clone(), c.uid.clone()]);

    let backward = store.next(Some("seq_no"), Some(true), 1).await.unwrap();
    assert_eq!(backward.len(), 1);
    assert_eq!(backward[0].uid, c.uid);

    let err = store.next(Some("uid; DROP TABLE"), None, 1).await.unwrap_err();
    assert!(matches!(err, BulkError::InvalidQuery(_)));
}

#[tokio::test]
async fn test_find_and_counts() {
    let (_db, store) = open_store().await;
    submit_pin(&store, &["/a"]).await;
    let started = submit_pin(&store, &["/b"]).await;
    store
        .store(
            &Subject::new(2000, 200),
            &Restriction::None,
            BulkRequest::new("DELETE"),
            &paths(&["/c"]),
        )
        .await
        .unwrap();
    store
        .update(started.uid.as_str(), BulkRequestStatus::Started)
        .await
        .unwrap();

    assert_eq!(store.find(None, None).await.unwrap().len(), 3);

    let filter = BulkRequestFilter {
        activities: vec!["PIN".to_string()],
        statuses: vec![BulkRequestStatus::Started],
        ..Default::default()
    };
    let found = store.find(Some(&filter), None).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].uid, started.uid);

    let by_path = BulkRequestFilter {
        target_path: Some("/c".to_string()),
        ..Default::default()
    };
    assert_eq!(store.count(Some(&by_path)).await.unwrap(), 1);
    assert_eq!(store.count(None).await.unwrap(), 3);
    assert_eq!(store.count_active().await.unwrap(), 1);
    assert_eq!(store.count_non_terminated("1000:100").await.unwrap(), 2);
    assert_eq!(store.count_non_terminated("2000:200").await.unwrap(), 1);
}

#[tokio::test]
async fn test_request_summaries() {
    let (_db, store) = open_store().await;
    let mut request = BulkRequest::new("PIN");
    request.url_prefix = "https://frontend.example.org/api/v1/bulk-requests".to_string();
    let first = submit(&store, request, &["/data/a", "/data/b"]).await;
    let second = submit_pin(&store, &["/data/c"]).await;

    let targets = store.targets().page(first.seq_no, 0, 10).await.unwrap();
    store
        .targets()
        .update_state(targets[0].id, TargetState::Completed, None)
        .await
        .unwrap();

    let summaries = store
        .get_request_summaries(&[BulkRequestStatus::Queued], &[], None, None)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(
        summaries[0].url,
        format!(
            "https://frontend.example.org/api/v1/bulk-requests/{}",
            first.uid
        )
    );
    assert_eq!(summaries[0].unprocessed, 1);
    assert_eq!(summaries[1].unprocessed, 1);

    let by_path = store
        .get_request_summaries(&[], &["1000:100".to_string()], Some("/data/c"), None)
        .await
        .unwrap();
    assert_eq!(by_path.len(), 1);
    assert_eq!(by_path[0].seq_no, second.seq_no);

    let floor = store
        .get_request_summaries(&[], &[], None, Some(second.seq_no))
        .await
        .unwrap();
    assert_eq!(floor.len(), 1);
}

#[tokio::test]
async fn test_request_info_pages_through_targets() {
    let config = StoreConfig {
        page_size: 2,
        ..StoreConfig::default()
    };
    let (_db, store) = open_store_with(config).await;
    let request = submit_pin(&store, &["/a", "/b", "/c", "/d", "/e"]).await;
    let uid = request.uid.as_str();

    let mut offset = 0;
    let mut seen = Vec::new();
    let mut pages = 0;
    loop {
        let info = store.get_request_info(&owner(), uid, offset).await.unwrap();
        assert!(info.targets.len() <= 2);
        pages += 1;
        seen.extend(info.targets.iter().map(|t| t.target.clone()));
        if info.next_seq_no == NO_FURTHER_ENTRIES {
            break;
        }
        assert_eq!(info.next_seq_no, info.targets[1].id + 1);
        offset = info.next_seq_no;
    }

    assert_eq!(pages, 3);
    assert_eq!(seen, paths(&["/a", "/b", "/c", "/d", "/e"]));
}

#[tokio::test]
async fn test_request_info_hides_root_and_strips_prefix() {
    let (_db, store) = open_store().await;
    let mut request = BulkRequest::new("PIN");
    request.target_prefix = Some("/data".to_string());
    let request = submit(&store, request, &["dir"]).await;

    store
        .targets()
        .insert(&NewTarget::discovered(request.seq_no, "/data/dir/file1"))
        .await
        .unwrap();
    store
        .targets()
        .abort(&NewTarget::root_failure(request.seq_no, "/data", "Abort", "x"))
        .await
        .unwrap();

    let info = store
        .get_request_info(&owner(), request.uid.as_str(), 0)
        .await
        .unwrap();
    assert_eq!(info.target_prefix.as_deref(), Some("/data"));
    assert_eq!(info.next_seq_no, NO_FURTHER_ENTRIES);

    let shown: Vec<_> = info
        .targets
        .iter()
        .map(|t| (t.target.as_str(), t.initial))
        .collect();
    assert_eq!(shown, vec![("dir", true), ("/dir/file1", false)]);
}

#[tokio::test]
async fn test_request_info_requires_request_subject() {
    let (_db, store) = open_store().await;
    let request = submit_pin(&store, &["/a"]).await;
    let uid = request.uid.as_str();

    let stranger = Subject::new(1000, 200);
    let err = store.get_request_info(&stranger, uid, 0).await.unwrap_err();
    assert!(err.is_permission_denied());
    assert!(!store.is_request_subject(&stranger, uid).await.unwrap());

    assert!(store.get_request_info(&Subject::root(), uid, 0).await.is_ok());
    let admin = Subject::new(3000, 300).with_admin_role();
    assert!(store.get_request_info(&admin, uid, 0).await.is_ok());

    let missing = store
        .get_request_info(&owner(), "0b0e0c4a-1111-4000-8000-000000000000", 0)
        .await
        .unwrap_err();
    assert!(missing.is_not_found());

    let err = store.clear(&stranger, uid).await.unwrap_err();
    assert!(err.is_permission_denied());
    assert!(store.get_request(uid).await.unwrap().is_some());

    // Unknown UIDs look the same as foreign ones
    let err = store
        .clear(&stranger, "0b0e0c4a-1111-4000-8000-000000000000")
        .await
        .unwrap_err();
    assert!(err.is_permission_denied());
}

#[tokio::test]
async fn test_subject_and_restriction_are_kept() {
    let (_db, store) = open_store().await;
    let subject = Subject::new(1000, 100).with_username("alice");
    let restriction = Restriction::Prefixes {
        paths: vec!["/data/atlas".to_string()],
    };
    let request = store
        .store(&subject, &restriction, BulkRequest::new("PIN"), &paths(&["/data/atlas/f"]))
        .await
        .unwrap();
    let uid = request.uid.as_str();

    assert_eq!(store.get_subject(uid).await.unwrap(), Some(subject));
    assert_eq!(store.get_restriction(uid).await.unwrap(), Some(restriction));
    assert_eq!(
        store
            .get_subject("0b0e0c4a-1111-4000-8000-000000000000")
            .await
            .unwrap(),
        None
    );
}
