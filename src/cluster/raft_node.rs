//! Raft driver ("ctrl")
//!
//! Owns the `RawNode` and its in-memory log. The main loop multiplexes the
//! logical clock, inbound messages, unreachable reports and proposals, and
//! after every event drains the node's Ready:
//! persist, send, deliver committed entries, advance.
//!
//! Proposals arrive through a separate pump task that merges client data and
//! configuration changes into one queue, so callers never touch the node.
//! The queue is only drained while a leader is known; until then proposals
//! wait in it and their senders block.

use crate::common::{Config, Error, Result};
use protobuf::Message as _;
use raft::eraftpb::{
    ConfChange, ConfChangeType, ConfState, Entry, EntryType, HardState, Message, MessageType,
    Snapshot,
};
use raft::storage::MemStorage;
use raft::{RawNode, SnapshotStatus, StateRole, Storage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const PROPOSAL_QUEUE: usize = 256;

/// Raft role of the local peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    #[default]
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::PreCandidate => write!(f, "pre-candidate"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

impl From<StateRole> for RaftRole {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Follower => RaftRole::Follower,
            StateRole::PreCandidate => RaftRole::PreCandidate,
            StateRole::Candidate => RaftRole::Candidate,
            StateRole::Leader => RaftRole::Leader,
        }
    }
}

/// Snapshot of the driver's state, published after every Ready
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftStatus {
    pub id: u64,
    pub role: RaftRole,
    pub term: u64,
    /// 0 when no leader is known
    pub leader_id: u64,
    pub voters: Vec<u64>,
    pub commit: u64,
    pub applied: u64,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }
}

/// Channels the driver consumes and feeds
pub struct RaftChannels {
    pub incoming_rx: mpsc::Receiver<Message>,
    pub outgoing_tx: mpsc::Sender<Message>,
    pub unreachable_rx: mpsc::Receiver<u64>,
    pub proposal_rx: mpsc::Receiver<Vec<u8>>,
    pub confchange_rx: mpsc::Receiver<ConfChange>,
    pub entry_tx: mpsc::Sender<Entry>,
    pub snapshot_tx: mpsc::Sender<Snapshot>,
    /// Fires once if the driver dies on its own, e.g. removed from the
    /// cluster
    pub exit_tx: oneshot::Sender<Error>,
}

enum Proposal {
    Data(Vec<u8>),
    ConfChange(ConfChange),
}

/// Handle on a running driver
pub struct RaftNode {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    status_rx: watch::Receiver<RaftStatus>,
}

impl RaftNode {
    /// Start the driver. With a non-empty `founders` set this peer founds a
    /// new cluster of those peers (itself included); otherwise it starts
    /// empty and waits to be added by an existing cluster.
    pub fn start(id: u64, founders: &[u64], config: &Config, channels: RaftChannels) -> Result<Self> {
        let storage = if founders.is_empty() {
            MemStorage::new()
        } else {
            let mut founders = founders.to_vec();
            if !founders.contains(&id) {
                founders.push(id);
            }
            bootstrap_storage(&founders)?
        };
        let mut voters = storage.initial_state()?.conf_state.voters;
        voters.sort_unstable();

        let raft_config = raft::Config {
            id,
            election_tick: config.election_ticks,
            heartbeat_tick: config.heartbeat_ticks,
            max_size_per_msg: config.max_size_per_msg,
            max_inflight_msgs: config.max_inflight_msgs,
            check_quorum: true,
            applied: 0,
            ..Default::default()
        };
        raft_config.validate()?;

        // Raft's own logging is discarded; the driver logs what matters.
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let raw = RawNode::new(&raft_config, storage.clone(), &logger)?;

        let (status_tx, status_rx) = watch::channel(RaftStatus {
            id,
            voters: voters.clone(),
            ..Default::default()
        });
        let (stop_tx, stop_rx) = oneshot::channel();

        tracing::info!(
            id = format_args!("{:x}", id),
            founders = founders.len(),
            "ctrl: starting"
        );

        let driver = Driver {
            id,
            raw,
            storage,
            voters,
            held: None,
            tick: config.tick_interval(),
            incoming_rx: channels.incoming_rx,
            outgoing_tx: channels.outgoing_tx,
            unreachable_rx: channels.unreachable_rx,
            entry_tx: channels.entry_tx,
            snapshot_tx: channels.snapshot_tx,
            status_tx,
        };
        let task = tokio::spawn(driver.run(
            stop_rx,
            channels.proposal_rx,
            channels.confchange_rx,
            channels.exit_tx,
        ));

        Ok(Self {
            stop_tx: Some(stop_tx),
            task,
            status_rx,
        })
    }

    pub fn status(&self) -> RaftStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RaftStatus> {
        self.status_rx.clone()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!("ctrl: driver panicked: {}", e);
        }
    }
}

/// Storage for a founding peer: one committed AddNode entry per founder, so
/// peers that join later learn the founding configuration from the log.
fn bootstrap_storage(founders: &[u64]) -> Result<MemStorage> {
    let mut founders = founders.to_vec();
    founders.sort_unstable();
    founders.dedup();

    let storage = MemStorage::new_with_conf_state(ConfState::from((founders.clone(), vec![])));

    let mut entries = Vec::with_capacity(founders.len());
    for (i, uid) in founders.iter().enumerate() {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = *uid;

        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.term = 1;
        entry.index = i as u64 + 1;
        entry.data = cc.write_to_bytes()?.into();
        entries.push(entry);
    }

    let mut hs = HardState::default();
    hs.term = 1;
    hs.commit = entries.len() as u64;

    let mut core = storage.wl();
    core.append(&entries)?;
    core.set_hardstate(hs);
    drop(core);

    Ok(storage)
}

async fn pump_proposals(
    mut proposal_rx: mpsc::Receiver<Vec<u8>>,
    mut confchange_rx: mpsc::Receiver<ConfChange>,
    out: mpsc::Sender<Proposal>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut data_open = true;
    let mut conf_open = true;
    while data_open || conf_open {
        let proposal = tokio::select! {
            _ = &mut stop_rx => return,
            data = proposal_rx.recv(), if data_open => match data {
                Some(data) => Proposal::Data(data),
                None => {
                    data_open = false;
                    continue;
                }
            },
            cc = confchange_rx.recv(), if conf_open => match cc {
                Some(cc) => Proposal::ConfChange(cc),
                None => {
                    conf_open = false;
                    continue;
                }
            },
        };
        if out.send(proposal).await.is_err() {
            return;
        }
    }
    tracing::debug!("ctrl: proposal inputs closed");
}

struct Driver {
    id: u64,
    raw: RawNode<MemStorage>,
    storage: MemStorage,
    /// Sorted
    voters: Vec<u64>,
    /// A proposal the node turned away, retried once a leader is known
    held: Option<Proposal>,
    tick: Duration,
    incoming_rx: mpsc::Receiver<Message>,
    outgoing_tx: mpsc::Sender<Message>,
    unreachable_rx: mpsc::Receiver<u64>,
    entry_tx: mpsc::Sender<Entry>,
    snapshot_tx: mpsc::Sender<Snapshot>,
    status_tx: watch::Sender<RaftStatus>,
}

impl Driver {
    async fn run(
        mut self,
        mut stop_rx: oneshot::Receiver<()>,
        proposal_rx: mpsc::Receiver<Vec<u8>>,
        confchange_rx: mpsc::Receiver<ConfChange>,
        exit_tx: oneshot::Sender<Error>,
    ) {
        let (pump_stop_tx, pump_stop_rx) = oneshot::channel();
        let (queue_tx, mut queue_rx) = mpsc::channel(PROPOSAL_QUEUE);
        let pump = tokio::spawn(pump_proposals(proposal_rx, confchange_rx, queue_tx, pump_stop_rx));

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let failure = loop {
            tokio::select! {
                _ = &mut stop_rx => break None,
                _ = ticker.tick() => {
                    self.raw.tick();
                }
                Some(proposal) = queue_rx.recv(), if self.accepts_proposals() => self.propose(proposal),
                Some(msg) = self.incoming_rx.recv() => self.step(msg),
                Some(uid) = self.unreachable_rx.recv() => {
                    tracing::trace!("ctrl: peer {:x} unreachable", uid);
                    self.raw.report_unreachable(uid);
                }
            }
            self.retry_held();

            if self.raw.has_ready() {
                if let Err(e) = self.handle_ready().await {
                    break Some(e);
                }
            }
        };

        match failure {
            None => tracing::debug!("ctrl: stop requested"),
            Some(Error::Stopped) => tracing::debug!("ctrl: downstream closed"),
            Some(e) => {
                if matches!(e, Error::Removed) {
                    tracing::warn!("ctrl: removed from the cluster");
                } else {
                    tracing::error!("ctrl: handle ready: {} (aborting)", e);
                }
                let _ = exit_tx.send(e);
            }
        }

        drop(pump_stop_tx);
        let _ = pump.await;
        tracing::info!(id = format_args!("{:x}", self.id), "ctrl: stopped");
    }

    fn accepts_proposals(&self) -> bool {
        self.held.is_none() && self.raw.raft.leader_id != raft::INVALID_ID
    }

    fn propose(&mut self, proposal: Proposal) {
        let result = match &proposal {
            Proposal::Data(data) => self.raw.propose(vec![], data.clone()),
            Proposal::ConfChange(cc) => {
                tracing::debug!(
                    "ctrl: propose conf change {:?} {:x}",
                    cc.get_change_type(),
                    cc.node_id
                );
                self.raw.propose_conf_change(vec![], cc.clone())
            }
        };
        match result {
            Ok(()) => {}
            Err(raft::Error::ProposalDropped) => {
                tracing::debug!("ctrl: proposal dropped (held for retry)");
                self.held = Some(proposal);
            }
            Err(e) => tracing::warn!("ctrl: propose: {} (discarded)", e),
        }
    }

    fn retry_held(&mut self) {
        if self.raw.raft.leader_id == raft::INVALID_ID {
            return;
        }
        if let Some(proposal) = self.held.take() {
            self.propose(proposal);
        }
    }

    fn step(&mut self, msg: Message) {
        let (from, msg_type) = (msg.from, msg.get_msg_type());
        if let Err(e) = self.raw.step(msg) {
            tracing::debug!("ctrl: step {:?} from {:x}: {}", msg_type, from, e);
        }
    }

    async fn handle_ready(&mut self) -> Result<()> {
        let mut ready = self.raw.ready();

        if !ready.snapshot().is_empty() {
            self.storage.wl().apply_snapshot(ready.snapshot().clone())?;
        }
        if let Some(hs) = ready.hs() {
            self.storage.wl().set_hardstate(hs.clone());
        }
        if !ready.entries().is_empty() {
            self.storage.wl().append(ready.entries())?;
        }

        self.send_messages(ready.take_messages()).await?;
        self.send_messages(ready.take_persisted_messages()).await?;

        if !ready.snapshot().is_empty() {
            self.snapshot_tx
                .send(ready.snapshot().clone())
                .await
                .map_err(|_| Error::Stopped)?;
        }
        self.apply_entries(ready.take_committed_entries()).await?;

        let mut light = self.raw.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }
        self.send_messages(light.take_messages()).await?;
        self.apply_entries(light.take_committed_entries()).await?;
        self.raw.advance_apply();

        self.publish_status();
        Ok(())
    }

    async fn send_messages(&mut self, msgs: Vec<Message>) -> Result<()> {
        for msg in msgs {
            let to = msg.to;
            let is_snapshot = msg.get_msg_type() == MessageType::MsgSnapshot;
            self.outgoing_tx.send(msg).await.map_err(|_| Error::Stopped)?;
            if is_snapshot {
                self.raw.report_snapshot(to, SnapshotStatus::Finish);
            }
        }
        Ok(())
    }

    async fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<()> {
        for entry in entries {
            let conf_change = if entry.get_entry_type() == EntryType::EntryConfChange
                && !entry.data.is_empty()
            {
                match ConfChange::parse_from_bytes(&entry.data) {
                    Ok(cc) => Some(cc),
                    Err(e) => {
                        tracing::warn!(index = entry.index, "ctrl: unmarshal ConfChange: {} (ignored)", e);
                        None
                    }
                }
            } else {
                None
            };

            self.entry_tx.send(entry).await.map_err(|_| Error::Stopped)?;

            if let Some(cc) = conf_change {
                self.apply_conf_change(&cc)?;
            }
        }
        Ok(())
    }

    fn apply_conf_change(&mut self, cc: &ConfChange) -> Result<()> {
        match self.raw.apply_conf_change(cc) {
            Ok(cs) => {
                self.voters = cs.voters.clone();
                self.voters.sort_unstable();
                self.storage.wl().set_conf_state(cs);
                tracing::info!(
                    "ctrl: applied {:?} {:x}, voters {:x?}",
                    cc.get_change_type(),
                    cc.node_id,
                    self.voters
                );
            }
            Err(e) => {
                tracing::warn!(
                    "ctrl: apply {:?} {:x}: {}",
                    cc.get_change_type(),
                    cc.node_id,
                    e
                );
            }
        }
        if cc.get_change_type() == ConfChangeType::RemoveNode && cc.node_id == self.id {
            return Err(Error::Removed);
        }
        Ok(())
    }

    fn publish_status(&self) {
        let raft = &self.raw.raft;
        self.status_tx.send_replace(RaftStatus {
            id: self.id,
            role: raft.state.into(),
            term: raft.term,
            leader_id: raft.leader_id,
            voters: self.voters.clone(),
            commit: raft.raft_log.committed,
            applied: raft.raft_log.applied,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Wired {
        node: RaftNode,
        incoming_tx: mpsc::Sender<Message>,
        outgoing_rx: mpsc::Receiver<Message>,
        proposal_tx: mpsc::Sender<Vec<u8>>,
        confchange_tx: mpsc::Sender<ConfChange>,
        _unreachable_tx: mpsc::Sender<u64>,
        entry_rx: mpsc::Receiver<Entry>,
        _snapshot_rx: mpsc::Receiver<Snapshot>,
        exit_rx: oneshot::Receiver<Error>,
    }

    fn fast_config() -> Config {
        Config {
            tick_interval_ms: 10,
            ..Default::default()
        }
    }

    fn wire(id: u64, founders: &[u64]) -> Wired {
        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(256);
        let (unreachable_tx, unreachable_rx) = mpsc::channel(16);
        let (proposal_tx, proposal_rx) = mpsc::channel(16);
        let (confchange_tx, confchange_rx) = mpsc::channel(16);
        let (entry_tx, entry_rx) = mpsc::channel(256);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = oneshot::channel();
        let node = RaftNode::start(
            id,
            founders,
            &fast_config(),
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
        )
        .unwrap();
        Wired {
            node,
            incoming_tx,
            outgoing_rx,
            proposal_tx,
            confchange_tx,
            _unreachable_tx: unreachable_tx,
            entry_rx,
            _snapshot_rx: snapshot_rx,
            exit_rx,
        }
    }

    async fn next_normal(rx: &mut mpsc::Receiver<Entry>) -> Entry {
        loop {
            let entry = rx.recv().await.unwrap();
            if entry.get_entry_type() == EntryType::EntryNormal && !entry.data.is_empty() {
                return entry;
            }
        }
    }

    #[test]
    fn test_bootstrap_log_has_one_add_per_founder() {
        let storage = bootstrap_storage(&[30, 10, 20]).unwrap();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.commit, 3);
        assert_eq!(state.hard_state.term, 1);
        assert_eq!(state.conf_state.voters, vec![10, 20, 30]);

        let entries = storage.entries(1, 4, None, raft::GetEntriesContext::empty(false)).unwrap();
        let targets: Vec<u64> = entries
            .iter()
            .map(|e| ConfChange::parse_from_bytes(&e.data).unwrap().node_id)
            .collect();
        assert_eq!(targets, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_single_founder_commits_proposals() {
        let mut w = wire(1, &[1]);

        // The founding conf entry comes through first.
        let first = w.entry_rx.recv().await.unwrap();
        assert_eq!(first.get_entry_type(), EntryType::EntryConfChange);

        w.proposal_tx.send(b"hello".to_vec()).await.unwrap();
        let entry = tokio::time::timeout(Duration::from_secs(5), next_normal(&mut w.entry_rx))
            .await
            .unwrap();
        assert_eq!(&entry.data[..], b"hello");
        assert!(w.node.status().is_leader());

        w.node.stop().await;
    }

    #[tokio::test]
    async fn test_three_founders_elect_a_leader() {
        let ids = [1u64, 2, 3];
        let mut nodes: HashMap<u64, Wired> = ids.iter().map(|&id| (id, wire(id, &ids))).collect();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let leader = loop {
            // Route outgoing messages by hand.
            let mut batch = Vec::new();
            for w in nodes.values_mut() {
                while let Ok(msg) = w.outgoing_rx.try_recv() {
                    batch.push(msg);
                }
                while w.entry_rx.try_recv().is_ok() {}
            }
            for msg in batch {
                if let Some(w) = nodes.get(&msg.to) {
                    let _ = w.incoming_tx.send(msg).await;
                }
            }
            if let Some(id) = ids.iter().find(|id| nodes[id].node.status().is_leader()) {
                break *id;
            }
            assert!(tokio::time::Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        let status = nodes[&leader].node.status();
        assert_eq!(status.voters, vec![1, 2, 3]);
        assert!(status.term >= 2);

        for (_, w) in nodes {
            w.node.stop().await;
        }
    }

    #[tokio::test]
    async fn test_removing_self_reports_exit() {
        let mut w = wire(1, &[1]);

        // Wait for leadership, then remove ourselves through the log.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !w.node.status().is_leader() {
            assert!(tokio::time::Instant::now() < deadline);
            while w.entry_rx.try_recv().is_ok() {}
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.node_id = 1;
        w.confchange_tx.send(cc).await.unwrap();

        let drain = async {
            while w.entry_rx.recv().await.is_some() {}
        };
        let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
        let err = tokio::time::timeout(Duration::from_secs(1), &mut w.exit_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::Removed));
        w.node.stop().await;
    }
}
