//! Configurator: turns membership deltas into Raft configuration changes
//!
//! Pending adds and removes are re-proposed on every retry tick until the
//! matching ConfChange commits. Proposals never wait on a full queue, since
//! the driver may be blocked delivering the conf entry this task consumes.

use crate::mesh::PeerUid;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry};
use protobuf::Message as _;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Pending membership work
#[derive(Debug, Default)]
pub struct PendingChanges {
    pending_add: BTreeSet<PeerUid>,
    pending_rem: BTreeSet<PeerUid>,
    /// Peers that left the mesh. A late AddNode for one of them has to be
    /// undone.
    departed: BTreeSet<PeerUid>,
}

impl PendingChanges {
    pub fn on_add(&mut self, uid: PeerUid) {
        self.departed.remove(&uid);
        self.pending_add.insert(uid);
    }

    pub fn on_remove(&mut self, uid: PeerUid) {
        self.departed.insert(uid);
        self.pending_rem.insert(uid);
    }

    /// Clear whatever the committed change satisfies.
    pub fn on_committed(&mut self, cc: &ConfChange) {
        let uid = cc.node_id;
        match cc.get_change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                self.pending_add.remove(&uid);
                if self.departed.contains(&uid) {
                    self.pending_rem.insert(uid);
                }
            }
            ConfChangeType::RemoveNode => {
                self.pending_rem.remove(&uid);
            }
        }
    }

    /// Every proposal due this tick
    pub fn proposals(&self) -> Vec<ConfChange> {
        let adds = self
            .pending_add
            .iter()
            .map(|uid| conf_change(ConfChangeType::AddNode, *uid));
        let rems = self
            .pending_rem
            .iter()
            .map(|uid| conf_change(ConfChangeType::RemoveNode, *uid));
        adds.chain(rems).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_add.is_empty() && self.pending_rem.is_empty()
    }
}

fn conf_change(change_type: ConfChangeType, uid: PeerUid) -> ConfChange {
    let mut cc = ConfChange::default();
    cc.set_change_type(change_type);
    cc.node_id = uid;
    cc
}

pub struct ConfiguratorChannels {
    pub add_rx: mpsc::Receiver<PeerUid>,
    pub rem_rx: mpsc::Receiver<PeerUid>,
    pub confentry_rx: mpsc::Receiver<Entry>,
    pub confchange_tx: mpsc::Sender<ConfChange>,
}

pub struct Configurator {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Configurator {
    pub fn start(retry: Duration, channels: ConfiguratorChannels) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run(retry, channels, stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

async fn run(retry: Duration, channels: ConfiguratorChannels, mut stop_rx: oneshot::Receiver<()>) {
    let ConfiguratorChannels {
        mut add_rx,
        mut rem_rx,
        mut confentry_rx,
        confchange_tx,
    } = channels;
    let mut pending = PendingChanges::default();
    let mut ticker = tokio::time::interval(retry);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            Some(uid) = add_rx.recv() => pending.on_add(uid),
            Some(uid) = rem_rx.recv() => pending.on_remove(uid),
            Some(entry) = confentry_rx.recv() => {
                match ConfChange::parse_from_bytes(&entry.data) {
                    Ok(cc) => pending.on_committed(&cc),
                    Err(e) => tracing::warn!(index = entry.index, "configurator: unmarshal ConfChange: {}", e),
                }
            }
            _ = ticker.tick() => {
                for cc in pending.proposals() {
                    match confchange_tx.try_send(cc) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => break,
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }
    tracing::debug!("configurator: stopped");
}
