//! Membership changes: leader failover, departures, shrinking below the
//! minimum

mod common;

use common::*;
use meshkv::{Error, LocalMesh};
use std::time::Duration;

#[tokio::test]
async fn leader_failover() {
    let mesh = LocalMesh::new();
    let mut nodes = start_cluster(&mesh, 3, 2).await;
    let leader = wait_for_leader(&nodes).await;
    eventually(Duration::from_secs(5), "three voters", || {
        nodes.iter().all(|n| n.status().voters.len() == 3)
    })
    .await;

    put(&nodes[0].kv(), "before", "fail").await;

    let old = nodes.remove(leader);
    let old_uid = old.uid();
    assert!(matches!(old.terminate().await, Error::Terminated));

    // The survivors elect a new leader and accept writes...
    let new_leader = wait_for_leader(&nodes).await;
    assert_ne!(nodes[new_leader].uid(), old_uid);
    put(&nodes[0].kv(), "after", "fail").await;

    // ...and both return it.
    for node in &nodes {
        let resp = get(&node.kv(), "after").await;
        assert_eq!(resp.kvs[0].value, b"fail");
    }

    terminate_all(nodes).await;
}

#[tokio::test]
async fn departure_removes_voter() {
    let mesh = LocalMesh::new();
    let mut nodes = start_cluster(&mesh, 5, 3).await;
    wait_for_leader(&nodes).await;
    eventually(Duration::from_secs(5), "five voters", || {
        nodes.iter().all(|n| n.status().voters.len() == 5)
    })
    .await;

    let gone = nodes.remove(2);
    let gone_uid = gone.uid();
    gone.terminate().await;

    eventually(Duration::from_secs(5), "departed voter removed", || {
        nodes
            .iter()
            .all(|n| n.status().voters.len() == 4 && !n.status().voters.contains(&gone_uid))
    })
    .await;

    // Writes keep working.
    let resp = put(&nodes[0].kv(), "still", "here").await;
    assert!(resp.header.revision > 1);

    terminate_all(nodes).await;
}

#[tokio::test]
async fn shrinking_below_minimum_terminates() {
    let mesh = LocalMesh::new();
    let mut nodes = start_cluster(&mesh, 3, 3).await;
    wait_for_leader(&nodes).await;

    let mut survivor = nodes.remove(0);
    for node in nodes {
        node.terminate().await;
    }

    let err = tokio::time::timeout(Duration::from_secs(2), survivor.wait())
        .await
        .expect("survivor kept running");
    assert!(matches!(err, Error::Shrunk { min: 3, .. }), "got {:?}", err);

    // The terminal error is reported once.
    assert!(matches!(survivor.wait().await, Error::Terminated));
}
