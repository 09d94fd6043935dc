//! Single-peer cluster: request semantics end to end through the log

mod common;

use common::*;
use meshkv::{
    Compare, CompareResult, CompactionRequest, DeleteRangeRequest, Error, LeaseGrantRequest,
    LeaseRevokeRequest, LocalMesh, PutRequest, RangeRequest, RequestOp, ResponseOp, TxnRequest,
};
use std::time::Duration;

#[tokio::test]
async fn create_put_get() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let kv = nodes[0].kv();

    let resp = put(&kv, "hello", "world").await;
    assert_eq!(resp.header.revision, 2);

    let resp = get(&kv, "hello").await;
    assert_eq!(resp.kvs.len(), 1);
    assert_eq!(resp.kvs[0].key, b"hello");
    assert_eq!(resp.kvs[0].value, b"world");
    assert_eq!(resp.kvs[0].version, 1);
    assert_eq!(resp.header.revision, 2);
    assert_eq!(resp.header.member_id, nodes[0].uid());

    terminate_all(nodes).await;
}

#[tokio::test]
async fn request_before_leader_is_elected() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    let kv = nodes[0].kv();

    // No waiting for the election: the request is held until there is a
    // leader to take it.
    let start = tokio::time::Instant::now();
    let resp = kv.put(PutRequest::new("early", "bird")).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(resp.header.revision, 2);
    assert!(nodes[0].status().is_leader());

    terminate_all(nodes).await;
}

#[tokio::test]
async fn overwrite_keeps_create_revision() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let kv = nodes[0].kv();

    let first = put(&kv, "k", "v1").await;
    let second = put(&kv, "k", "v2").await;
    assert!(second.header.revision > first.header.revision);

    let resp = get(&kv, "k").await;
    let kv0 = &resp.kvs[0];
    assert_eq!(kv0.value, b"v2");
    assert_eq!(kv0.version, 2);
    assert_eq!(kv0.create_revision, first.header.revision);
    assert_eq!(kv0.mod_revision, second.header.revision);

    let del = kv.delete_range(DeleteRangeRequest::key("k")).await.unwrap();
    assert_eq!(del.deleted, 1);
    assert!(get(&kv, "k").await.kvs.is_empty());

    terminate_all(nodes).await;
}

#[tokio::test]
async fn prefix_delete() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let kv = nodes[0].kv();

    put(&kv, "p/a", "1").await;
    put(&kv, "p/b", "2").await;
    put(&kv, "q/a", "3").await;

    let del = kv.delete_range(DeleteRangeRequest::prefix("p/")).await.unwrap();
    assert_eq!(del.deleted, 2);

    let all = kv.range(RangeRequest::from_key("")).await.unwrap();
    let keys: Vec<_> = all.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(keys, vec![b"q/a".to_vec()]);

    terminate_all(nodes).await;
}

#[tokio::test]
async fn compaction_error() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let kv = nodes[0].kv();

    let r1 = put(&kv, "k", "a").await.header.revision;
    let r2 = put(&kv, "k", "b").await.header.revision;
    kv.compact(CompactionRequest { revision: r2 }).await.unwrap();

    let err = kv.range(RangeRequest::key("k").with_revision(r1)).await.unwrap_err();
    assert!(matches!(err, Error::Compacted), "got {:?}", err);

    // The current revision is untouched.
    let resp = kv.range(RangeRequest::key("k")).await.unwrap();
    assert_eq!(resp.kvs[0].value, b"b");
    assert_eq!(resp.header.revision, r2);

    let err = kv.compact(CompactionRequest { revision: r2 }).await.unwrap_err();
    assert!(matches!(err, Error::Compacted));
    let err = kv.compact(CompactionRequest { revision: r2 + 10 }).await.unwrap_err();
    assert!(matches!(err, Error::FutureRevision));

    terminate_all(nodes).await;
}

#[tokio::test]
async fn txn_guards_on_missing_key() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let kv = nodes[0].kv();

    // Version 0 on a never-written key holds.
    let resp = kv
        .txn(TxnRequest {
            compare: vec![Compare::version("fresh", CompareResult::Equal, 0)],
            success: vec![RequestOp::Put(PutRequest::new("fresh", "created"))],
            failure: vec![],
        })
        .await
        .unwrap();
    assert!(resp.succeeded);
    assert!(matches!(resp.responses[0], ResponseOp::Put(_)));

    // An empty-value guard on a never-written key fails.
    let resp = kv
        .txn(TxnRequest {
            compare: vec![Compare::value("missing", CompareResult::Equal, "")],
            success: vec![RequestOp::Put(PutRequest::new("missing", "x"))],
            failure: vec![RequestOp::Range(RangeRequest::key("fresh"))],
        })
        .await
        .unwrap();
    assert!(!resp.succeeded);
    match &resp.responses[0] {
        ResponseOp::Range(r) => assert_eq!(r.kvs[0].value, b"created"),
        other => panic!("unexpected response {:?}", other),
    }
    assert!(get(&kv, "missing").await.kvs.is_empty());

    terminate_all(nodes).await;
}

#[tokio::test]
async fn lease_revoke_deletes_keys() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let kv = nodes[0].kv();

    let lease = kv.lease_grant(LeaseGrantRequest { ttl: 60, id: 0 }).await.unwrap();
    assert!(lease.id > 0);
    assert_eq!(lease.ttl, 60);

    kv.put(PutRequest::new("leased/a", "1").with_lease(lease.id)).await.unwrap();
    kv.put(PutRequest::new("leased/b", "2").with_lease(lease.id)).await.unwrap();
    put(&kv, "plain", "3").await;

    let err = kv.put(PutRequest::new("x", "y").with_lease(lease.id + 1)).await.unwrap_err();
    assert!(matches!(err, Error::LeaseNotFound(_)));

    kv.lease_revoke(LeaseRevokeRequest { id: lease.id }).await.unwrap();
    let left = kv.range(RangeRequest::from_key("")).await.unwrap();
    let keys: Vec<_> = left.kvs.iter().map(|kv| kv.key.clone()).collect();
    assert_eq!(keys, vec![b"plain".to_vec()]);

    terminate_all(nodes).await;
}

#[tokio::test]
async fn oversized_request_rejected() {
    let mesh = LocalMesh::new();
    let nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let kv = nodes[0].kv();

    let big = "x".repeat(10_000);
    let err = kv.put(PutRequest::new("big", big)).await.unwrap_err();
    assert!(matches!(err, Error::TooLarge { .. }));

    // Nothing was proposed.
    let resp = kv.range(RangeRequest::key("big")).await.unwrap();
    assert!(resp.kvs.is_empty());
    assert_eq!(resp.header.revision, 1);

    terminate_all(nodes).await;
}

#[tokio::test]
async fn terminate_reports_terminated() {
    let mesh = LocalMesh::new();
    let mut nodes = start_cluster(&mesh, 1, 1).await;
    wait_for_leader(&nodes).await;
    let node = nodes.remove(0);
    let uid = node.uid();
    let kv = node.kv();

    let err = node.terminate().await;
    assert!(matches!(err, Error::Terminated));
    assert!(!mesh.peers().contains(&uid));

    let err = tokio::time::timeout(Duration::from_secs(2), kv.range(RangeRequest::key("k")))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Stopped | Error::Canceled(_)), "got {:?}", err);
}
