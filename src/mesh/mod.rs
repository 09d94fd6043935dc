//! Mesh collaborators
//!
//! The gossip mesh itself lives outside this crate. Peers consume it through
//! three narrow seams:
//! - [`PacketConn`]: a lossy datagram socket addressed by [`MeshAddr`]
//! - [`PeerDirectory`]: `PeerUid` → `PeerName` translation
//! - [`Membership`]: the set of peers currently on the mesh
//!
//! [`local::LocalMesh`] implements all three in-process.

pub mod local;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::io;

pub use local::{LocalMesh, LocalPeer};

/// Per-process unique peer identifier. Doubles as the Raft node ID, so a
/// restarted process always rejoins under a new one.
pub type PeerUid = u64;

/// Stable mesh-layer label of a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerName(pub String);

impl std::fmt::Display for PeerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerName {
    fn from(s: &str) -> Self {
        PeerName(s.to_string())
    }
}

/// Datagram address on the mesh
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshAddr {
    pub name: PeerName,
    pub uid: PeerUid,
}

impl std::fmt::Display for MeshAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:x})", self.name, self.uid)
    }
}

/// Bidirectional packet endpoint.
///
/// Delivery is unordered and lossy. `close` must wake a pending `recv_from`,
/// which then returns an error. A datagram larger than the receive buffer
/// is consumed and reported as `InvalidData`.
pub trait PacketConn: Send + Sync + 'static {
    fn recv_from(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<(usize, MeshAddr)>> + Send;

    fn send_to(&self, buf: &[u8], addr: &MeshAddr) -> impl Future<Output = io::Result<usize>> + Send;

    fn close(&self);

    fn local_addr(&self) -> MeshAddr;
}

/// Translates Raft node IDs to mesh peer names. Called on every outbound
/// packet; must be safe to call concurrently.
pub trait PeerDirectory: Send + Sync + 'static {
    fn translate(&self, uid: PeerUid) -> crate::Result<PeerName>;
}

/// Current mesh membership, including the local peer.
pub trait Membership: Send + Sync + 'static {
    fn current_peers(&self) -> BTreeSet<PeerUid>;
}

/// Everything a peer needs from the mesh
pub trait Mesh: PacketConn + PeerDirectory + Membership {}

impl<T: PacketConn + PeerDirectory + Membership> Mesh for T {}
