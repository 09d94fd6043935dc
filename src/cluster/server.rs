//! Server manager
//!
//! Bootstraps a peer on the mesh and owns the lifetimes of its components.
//! A [`Node`] runs until it is terminated, removed from the cluster, or the
//! mesh shrinks below the configured minimum; whichever comes first is
//! reported once as the node's terminal error.

use crate::cluster::configurator::{Configurator, ConfiguratorChannels};
use crate::cluster::membership::{MembershipChannels, MembershipPoller};
use crate::cluster::raft_node::{RaftChannels, RaftNode, RaftStatus};
use crate::cluster::transport::Transport;
use crate::common::{Config, Error, Result};
use crate::mesh::{Membership, Mesh, PeerUid};
use crate::store::{KvServer, KvStore, StoreChannels};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const MESSAGE_QUEUE: usize = 1024;
const PROPOSAL_QUEUE: usize = 256;
const ENTRY_QUEUE: usize = 1024;
const CONF_QUEUE: usize = 64;
const SNAPSHOT_QUEUE: usize = 4;

/// One running peer
pub struct Node {
    uid: PeerUid,
    kv: KvServer,
    status_rx: watch::Receiver<RaftStatus>,
    terminate_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Error>>,
}

/// Components owned by the manager task, in shutdown order
struct Parts<M: Mesh> {
    membership: MembershipPoller,
    configurator: Configurator,
    transport: Transport<M>,
    store: KvStore,
    raft: RaftNode,
}

impl Node {
    /// Wait until the mesh has enough peers, then found or join a cluster
    /// and start serving.
    ///
    /// Exactly `min_peer_count` peers on the mesh founds a new cluster with
    /// them; more than that joins the existing one. Dropping the returned
    /// future while waiting is safe.
    pub async fn start<M: Mesh>(mesh: Arc<M>, config: Config) -> Result<Node> {
        config.validate()?;
        let uid = mesh.local_addr().uid;
        let (founders, initial) = await_bootstrap(mesh.as_ref(), &config).await;

        let (incoming_tx, incoming_rx) = mpsc::channel(MESSAGE_QUEUE);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(MESSAGE_QUEUE);
        let (unreachable_tx, unreachable_rx) = mpsc::channel(config.unreachable_buffer);
        let (proposal_tx, proposal_rx) = mpsc::channel(PROPOSAL_QUEUE);
        let (confchange_tx, confchange_rx) = mpsc::channel(CONF_QUEUE);
        let (entry_tx, entry_rx) = mpsc::channel(ENTRY_QUEUE);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(SNAPSHOT_QUEUE);
        let (confentry_tx, confentry_rx) = mpsc::channel(CONF_QUEUE);
        let (add_tx, add_rx) = mpsc::channel(CONF_QUEUE);
        let (rem_tx, rem_rx) = mpsc::channel(CONF_QUEUE);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (shrunk_tx, shrunk_rx) = oneshot::channel();

        let raft = RaftNode::start(
            uid,
            &founders,
            &config,
            RaftChannels {
                incoming_rx,
                outgoing_tx,
                unreachable_rx,
                proposal_rx,
                confchange_rx,
                entry_tx,
                snapshot_tx,
                exit_tx,
            },
        )?;
        let status_rx = raft.subscribe();

        let (store, kv) = match KvStore::start(
            &config,
            uid,
            StoreChannels {
                entry_rx,
                snapshot_rx,
                confentry_tx,
                proposal_tx,
            },
        ) {
            Ok(started) => started,
            Err(e) => {
                raft.stop().await;
                return Err(e);
            }
        };

        let transport = Transport::start(mesh.clone(), &config, incoming_tx, outgoing_rx, unreachable_tx);
        let configurator = Configurator::start(
            config.conf_change_retry(),
            ConfiguratorChannels {
                add_rx,
                rem_rx,
                confentry_rx,
                confchange_tx,
            },
        );
        let membership = MembershipPoller::start(
            mesh.clone(),
            initial,
            config.min_peer_count,
            config.membership_poll(),
            MembershipChannels {
                add_tx,
                rem_tx,
                shrunk_tx,
            },
        );

        let parts = Parts {
            membership,
            configurator,
            transport,
            store,
            raft,
        };
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = tokio::spawn(manage(
            uid,
            config.min_peer_count,
            parts,
            terminate_rx,
            exit_rx,
            shrunk_rx,
        ));

        tracing::info!(
            uid = format_args!("{:x}", uid),
            founding = !founders.is_empty(),
            "server: started"
        );
        Ok(Node {
            uid,
            kv,
            status_rx,
            terminate_tx: Some(terminate_tx),
            handle: Some(handle),
        })
    }

    /// Raft node ID of this peer (its mesh UID)
    pub fn uid(&self) -> PeerUid {
        self.uid
    }

    /// KV RPC surface of this peer
    pub fn kv(&self) -> KvServer {
        self.kv.clone()
    }

    pub fn status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status_rx.clone()
    }

    /// Wait for the node to stop on its own and return why. Returns
    /// [`Error::Terminated`] once the terminal error was already taken.
    pub async fn wait(&mut self) -> Error {
        let Some(handle) = self.handle.as_mut() else {
            return Error::Terminated;
        };
        let err = match handle.await {
            Ok(err) => err,
            Err(e) => Error::Internal(format!("manager task failed: {}", e)),
        };
        self.handle = None;
        err
    }

    /// Shut the node down and return its terminal error; normally
    /// [`Error::Terminated`], unless it had already stopped for another
    /// reason.
    pub async fn terminate(mut self) -> Error {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(());
        }
        self.wait().await
    }
}

async fn await_bootstrap<M: Membership>(mesh: &M, config: &Config) -> (Vec<PeerUid>, BTreeSet<PeerUid>) {
    let min = config.min_peer_count;
    let mut ticker = tokio::time::interval(config.membership_poll());
    loop {
        ticker.tick().await;
        let peers = mesh.current_peers();
        match peers.len().cmp(&min) {
            Ordering::Equal => {
                tracing::info!("server: {} peers on the mesh, founding a cluster", peers.len());
                return (peers.iter().copied().collect(), peers);
            }
            Ordering::Greater => {
                tracing::info!("server: {} peers on the mesh, joining", peers.len());
                return (Vec::new(), peers);
            }
            Ordering::Less => {
                tracing::debug!("server: waiting for peers ({}/{})", peers.len(), min);
            }
        }
    }
}

async fn manage<M: Mesh>(
    uid: PeerUid,
    min_peers: usize,
    parts: Parts<M>,
    mut terminate_rx: oneshot::Receiver<()>,
    mut exit_rx: oneshot::Receiver<Error>,
    mut shrunk_rx: oneshot::Receiver<usize>,
) -> Error {
    // A dropped Node handle counts as a terminate request.
    let err = tokio::select! {
        _ = &mut terminate_rx => Error::Terminated,
        Ok(err) = &mut exit_rx => err,
        Ok(have) = &mut shrunk_rx => Error::Shrunk { have, min: min_peers },
    };

    match err {
        Error::Terminated => tracing::info!(uid = format_args!("{:x}", uid), "server: shutting down"),
        _ => tracing::warn!(uid = format_args!("{:x}", uid), "server: shutting down: {}", err),
    }

    // The store goes before the driver, which may be blocked delivering
    // its last committed entry.
    parts.membership.stop().await;
    parts.configurator.stop().await;
    parts.transport.stop().await;
    parts.store.stop().await;
    parts.raft.stop().await;

    tracing::info!(uid = format_args!("{:x}", uid), "server: stopped");
    err
}
