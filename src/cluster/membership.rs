//! Mesh membership poller
//!
//! Scans the mesh peer set on an interval and reports joins and departures
//! to the configurator. Dropping below the configured minimum is fatal: the
//! poller reports it once and exits.

use crate::mesh::{Membership, PeerUid};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Outputs of the poller
pub struct MembershipChannels {
    pub add_tx: mpsc::Sender<PeerUid>,
    pub rem_tx: mpsc::Sender<PeerUid>,
    /// Fires with the observed peer count when the mesh shrinks below the
    /// minimum
    pub shrunk_tx: oneshot::Sender<usize>,
}

pub struct MembershipPoller {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MembershipPoller {
    /// Start polling. `initial` is the peer set the cluster was bootstrapped
    /// with; only changes relative to it are reported.
    pub fn start<M: Membership>(
        mesh: Arc<M>,
        initial: BTreeSet<PeerUid>,
        min_peers: usize,
        interval: Duration,
        channels: MembershipChannels,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(poll_loop(mesh, initial, min_peers, interval, channels, stop_rx));
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

async fn poll_loop<M: Membership>(
    mesh: Arc<M>,
    mut previous: BTreeSet<PeerUid>,
    min_peers: usize,
    interval: Duration,
    channels: MembershipChannels,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let MembershipChannels {
        add_tx,
        rem_tx,
        shrunk_tx,
    } = channels;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = &mut stop_rx => return,
            _ = ticker.tick() => {}
        }

        let current = mesh.current_peers();
        for uid in current.difference(&previous) {
            tracing::info!("membership: peer {:x} joined", uid);
            if add_tx.send(*uid).await.is_err() {
                return;
            }
        }
        for uid in previous.difference(&current) {
            tracing::info!("membership: peer {:x} departed", uid);
            if rem_tx.send(*uid).await.is_err() {
                return;
            }
        }

        if current.len() < min_peers {
            tracing::warn!(
                "membership: {} peers on the mesh, below the minimum of {}",
                current.len(),
                min_peers
            );
            let _ = shrunk_tx.send(current.len());
            return;
        }
        previous = current;
    }
}
