//! Shared helpers for cluster tests on the in-process mesh

#![allow(dead_code)]

use meshkv::{Config, KvServer, LocalMesh, Node, PutRequest, PutResponse, RangeRequest, RangeResponse};
use std::sync::Arc;
use std::time::Duration;

/// Short timings so elections and membership changes settle quickly
pub fn fast_config(min_peers: usize) -> Config {
    Config {
        tick_interval_ms: 20,
        membership_poll_ms: 200,
        conf_change_retry_ms: 200,
        request_timeout_ms: 1000,
        min_peer_count: min_peers,
        ..Default::default()
    }
}

/// Start `n` peers: exactly `min_peers` found the cluster together, the
/// rest join one at a time.
pub async fn start_cluster(mesh: &LocalMesh, n: usize, min_peers: usize) -> Vec<Node> {
    let config = fast_config(min_peers);
    let founders: Vec<_> = (0..min_peers)
        .map(|i| Arc::new(mesh.join(format!("peer-{}", i))))
        .collect();
    let mut nodes = futures_util::future::try_join_all(
        founders.into_iter().map(|peer| Node::start(peer, config.clone())),
    )
    .await
    .unwrap();
    for i in min_peers..n {
        nodes.push(join_peer(mesh, &format!("peer-{}", i), &config).await);
    }
    nodes
}

pub async fn join_peer(mesh: &LocalMesh, name: &str, config: &Config) -> Node {
    let peer = Arc::new(mesh.join(name));
    Node::start(peer, config.clone()).await.unwrap()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Index of the leader, once every node agrees on one
pub async fn wait_for_leader(nodes: &[Node]) -> usize {
    let mut leader = None;
    eventually(Duration::from_secs(10), "a leader", || {
        let statuses: Vec<_> = nodes.iter().map(|n| n.status()).collect();
        let Some(idx) = statuses.iter().position(|s| s.is_leader()) else {
            return false;
        };
        let id = statuses[idx].id;
        if statuses.iter().all(|s| s.leader_id == id) {
            leader = Some(idx);
            true
        } else {
            false
        }
    })
    .await;
    leader.unwrap()
}

pub async fn put(kv: &KvServer, key: &str, value: &str) -> PutResponse {
    kv.put(PutRequest::new(key, value)).await.unwrap()
}

pub async fn get(kv: &KvServer, key: &str) -> RangeResponse {
    kv.range(RangeRequest::key(key)).await.unwrap()
}

pub async fn terminate_all(nodes: Vec<Node>) {
    for node in nodes {
        node.terminate().await;
    }
}
