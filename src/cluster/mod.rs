//! Cluster layer: Raft driver, mesh transport, membership reconciliation,
//! the per-peer server manager and its JSON gateway.

pub mod configurator;
pub mod http;
pub mod membership;
pub mod raft_node;
pub mod server;
pub mod transport;

pub use http::{create_router, GatewayState};
pub use raft_node::{RaftRole, RaftStatus};
pub use server::Node;
