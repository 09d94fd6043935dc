//! In-process mesh
//!
//! A hub routing datagrams between endpoints of the same process. Used by
//! the integration tests and the `meshkv` binary. Inboxes are bounded and
//! drop on overflow, like a real datagram socket under load.

use super::{MeshAddr, PacketConn, PeerDirectory, PeerName, PeerUid, Membership};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

const INBOX_CAPACITY: usize = 1024;

type Datagram = (Vec<u8>, MeshAddr);

struct Slot {
    name: PeerName,
    inbox: mpsc::Sender<Datagram>,
}

#[derive(Default)]
struct Hub {
    peers: BTreeMap<PeerUid, Slot>,
    isolated: HashSet<PeerUid>,
}

/// Shared handle to the hub
#[derive(Clone, Default)]
pub struct LocalMesh {
    hub: Arc<Mutex<Hub>>,
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(|e| e.into_inner())
}

impl LocalMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the mesh under `name` with a fresh UID.
    pub fn join(&self, name: impl Into<String>) -> LocalPeer {
        let name = PeerName(name.into());
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let mut hub = lock(&self.hub);
        let uid = loop {
            let candidate: PeerUid = rand::random();
            if candidate != 0 && !hub.peers.contains_key(&candidate) {
                break candidate;
            }
        };
        hub.peers.insert(
            uid,
            Slot {
                name: name.clone(),
                inbox: tx,
            },
        );
        tracing::debug!(peer = %name, uid = format_args!("{:x}", uid), "mesh: joined");
        LocalPeer {
            hub: self.hub.clone(),
            addr: MeshAddr { name, uid },
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// UIDs currently on the mesh
    pub fn peers(&self) -> BTreeSet<PeerUid> {
        lock(&self.hub).peers.keys().copied().collect()
    }

    /// Drop all traffic to and from `uid` without changing membership.
    pub fn isolate(&self, uid: PeerUid) {
        lock(&self.hub).isolated.insert(uid);
    }

    pub fn heal(&self, uid: PeerUid) {
        lock(&self.hub).isolated.remove(&uid);
    }
}

/// One endpoint on a [`LocalMesh`]
pub struct LocalPeer {
    hub: Arc<Mutex<Hub>>,
    addr: MeshAddr,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
}

impl LocalPeer {
    pub fn uid(&self) -> PeerUid {
        self.addr.uid
    }

    pub fn name(&self) -> &PeerName {
        &self.addr.name
    }

    /// Leave the mesh. Same as closing the socket.
    pub fn leave(&self) {
        self.close();
    }
}

impl PacketConn for LocalPeer {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, MeshAddr)> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some((data, from)) if data.len() > buf.len() => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} byte datagram from {} does not fit a {} byte buffer", data.len(), from, buf.len()),
            )),
            Some((data, from)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok((data.len(), from))
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed")),
        }
    }

    async fn send_to(&self, buf: &[u8], addr: &MeshAddr) -> io::Result<usize> {
        let hub = lock(&self.hub);
        if !hub.peers.contains_key(&self.addr.uid) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "endpoint closed"));
        }
        let slot = match hub.peers.get(&addr.uid) {
            Some(slot) if slot.name == addr.name => slot,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no route to {}", addr),
                ))
            }
        };
        if hub.isolated.contains(&self.addr.uid) || hub.isolated.contains(&addr.uid) {
            return Ok(buf.len());
        }
        match slot.inbox.try_send((buf.to_vec(), self.addr.clone())) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(buf.len()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} went away", addr),
            )),
        }
    }

    fn close(&self) {
        if lock(&self.hub).peers.remove(&self.addr.uid).is_some() {
            tracing::debug!(peer = %self.addr, "mesh: left");
        }
    }

    fn local_addr(&self) -> MeshAddr {
        self.addr.clone()
    }
}

impl PeerDirectory for LocalPeer {
    fn translate(&self, uid: PeerUid) -> crate::Result<PeerName> {
        lock(&self.hub)
            .peers
            .get(&uid)
            .map(|slot| slot.name.clone())
            .ok_or(crate::Error::UnknownPeer(uid))
    }
}

impl Membership for LocalPeer {
    fn current_peers(&self) -> BTreeSet<PeerUid> {
        lock(&self.hub).peers.keys().copied().collect()
    }
}

impl Drop for LocalPeer {
    fn drop(&mut self) {
        self.close();
    }
}
