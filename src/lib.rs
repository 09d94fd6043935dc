//! # meshkv
//!
//! An embedded, etcd-compatible key-value store replicated with Raft, using
//! a gossip mesh as its only transport:
//! - Peers found or join a cluster as they appear on the mesh
//! - Mesh joins and departures become Raft configuration changes
//! - Every request goes through the Raft log and is applied to a
//!   multi-version store, so all peers hold identical state
//!
//! ## Architecture
//!
//! ```text
//!   KvServer ──► proposals ──► ctrl (Raft) ◄──► transport ◄──► mesh
//!      ▲                          │
//!      └──── results ◄── store ◄──┘ committed entries
//!                          │
//!                          └──► conf entries ──► configurator ◄── membership
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! # async fn demo() -> meshkv::Result<()> {
//! use meshkv::{Config, LocalMesh, Node, PutRequest, RangeRequest};
//! use std::sync::Arc;
//!
//! let mesh = LocalMesh::new();
//! let node = Node::start(Arc::new(mesh.join("a")), Config::default()).await?;
//! node.kv().put(PutRequest::new("hello", "world")).await?;
//! let resp = node.kv().range(RangeRequest::key("hello")).await?;
//! assert_eq!(resp.kvs[0].value, b"world");
//! # Ok(())
//! # }
//! ```

#![allow(clippy::result_large_err)]

pub mod cluster;
pub mod common;
pub mod mesh;
pub mod store;

// Re-export commonly used types
pub use cluster::{Node, RaftRole, RaftStatus};
pub use common::{Config, Error, Result};
pub use mesh::{LocalMesh, LocalPeer, Mesh, PeerName, PeerUid};
pub use store::types::*;
pub use store::KvServer;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
