//! Replicated KV store
//!
//! The store loop owns the MVCC store, the lessor and the pending-request
//! map. It applies committed entries in log order and hands each result to
//! the local caller that proposed it, if any. [`KvServer`] is the RPC side:
//! it proposes requests and waits for them to come back through the log.

pub mod apply;
pub mod backend;
pub mod index;
pub mod lease;
pub mod mvcc;
pub mod types;

pub use apply::Applier;
pub use backend::{Backend, MemBackend, RocksBackend};
pub use mvcc::MvccStore;
pub use types::*;

use crate::common::{Config, Error, IdGenerator, Result};
use raft::eraftpb::{Entry, EntryType, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Reply = oneshot::Sender<Result<InternalResponse>>;

/// Requests from RPC handlers to the store loop
enum Action {
    Register { id: u64, tx: Reply },
    Cancel { id: u64 },
    Hash { revision: i64, tx: oneshot::Sender<Result<HashKvResponse>> },
}

/// Channels connecting the store to the Raft driver and the configurator
pub struct StoreChannels {
    /// Committed entries, in log order
    pub entry_rx: mpsc::Receiver<Entry>,
    pub snapshot_rx: mpsc::Receiver<Snapshot>,
    /// Committed ConfChange entries, forwarded to the configurator
    pub confentry_tx: mpsc::Sender<Entry>,
    /// Marshaled requests to propose
    pub proposal_tx: mpsc::Sender<Vec<u8>>,
}

/// Handle on a running store loop
pub struct KvStore {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl KvStore {
    /// Open the backend and start the store loop.
    pub fn start(config: &Config, member_id: u64, channels: StoreChannels) -> Result<(KvStore, KvServer)> {
        let backend = backend::open(config.backend)?;
        let applier = Applier::new(MvccStore::new(backend), member_id);

        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let store_loop = StoreLoop {
            applier,
            applied_index: 0,
            pending: HashMap::new(),
            entry_rx: channels.entry_rx,
            snapshot_rx: channels.snapshot_rx,
            confentry_tx: channels.confentry_tx,
            action_rx,
        };
        let task = tokio::spawn(store_loop.run(stop_rx));

        let server = KvServer {
            inner: Arc::new(ServerInner {
                member_id,
                ids: IdGenerator::new(member_id),
                proposal_tx: channels.proposal_tx,
                action_tx,
                max_request_bytes: config.max_request_bytes,
                request_timeout: config.request_timeout(),
            }),
        };

        tracing::info!(member = format_args!("{:x}", member_id), backend = ?config.backend, "store: started");
        Ok((
            KvStore {
                stop_tx: Some(stop_tx),
                task,
            },
            server,
        ))
    }

    /// Stop the loop. Outstanding requests fail with [`Error::Stopped`] and
    /// the backend is dropped.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::error!("store: loop panicked: {}", e);
        }
    }
}

struct StoreLoop {
    applier: Applier,
    applied_index: u64,
    pending: HashMap<u64, Reply>,
    entry_rx: mpsc::Receiver<Entry>,
    snapshot_rx: mpsc::Receiver<Snapshot>,
    confentry_tx: mpsc::Sender<Entry>,
    action_rx: mpsc::UnboundedReceiver<Action>,
}

impl StoreLoop {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        loop {
            // Registrations go first so a request is pending before its
            // entry can be applied.
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    tracing::debug!("store: stop requested");
                    break;
                }
                Some(action) = self.action_rx.recv() => self.handle_action(action),
                Some(snapshot) = self.snapshot_rx.recv() => self.apply_snapshot(snapshot),
                entry = self.entry_rx.recv() => match entry {
                    Some(entry) => self.apply_entry(entry).await,
                    None => {
                        tracing::info!("store: entry channel closed");
                        break;
                    }
                },
            }
        }

        if !self.pending.is_empty() {
            tracing::debug!(pending = self.pending.len(), "store: dropping pending requests");
        }
        tracing::info!(
            applied = self.applied_index,
            rev = self.applier.mvcc().rev(),
            "store: stopped"
        );
    }

    fn handle_action(&mut self, action: Action) {
        match action {
            Action::Register { id, tx } => {
                self.pending.insert(id, tx);
            }
            Action::Cancel { id } => {
                if self.pending.remove(&id).is_some() {
                    tracing::debug!("store: canceled pending request {:x}", id);
                }
            }
            Action::Hash { revision, tx } => {
                let applied = self.applied_index;
                let result = self.applier.hash_kv(revision).map(|mut r| {
                    r.applied_index = applied;
                    r
                });
                let _ = tx.send(result);
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        let meta = snapshot.get_metadata();
        if snapshot.data.is_empty() {
            tracing::debug!(index = meta.index, "store: empty snapshot");
            return;
        }
        tracing::warn!(
            index = meta.index,
            size = snapshot.data.len(),
            "store: snapshot restore is not supported; ignoring"
        );
    }

    async fn apply_entry(&mut self, entry: Entry) {
        self.applied_index = entry.index;

        match entry.get_entry_type() {
            EntryType::EntryNormal => {}
            EntryType::EntryConfChange => {
                if self.confentry_tx.send(entry).await.is_err() {
                    tracing::debug!("store: configurator gone, dropping conf entry");
                }
                return;
            }
            EntryType::EntryConfChangeV2 => {
                tracing::warn!(index = entry.index, "store: unexpected ConfChangeV2 entry");
                return;
            }
        }

        if entry.data.is_empty() {
            return;
        }

        let req: InternalRequest = match bincode::deserialize(&entry.data) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(index = entry.index, "store: undecodable entry: {}", e);
                return;
            }
        };

        let id = req.id;
        let result = self.applier.apply(req.op, entry.index, entry.term);
        if let Err(e) = &result {
            tracing::debug!(index = entry.index, "store: request {:x} failed: {}", id, e);
        }

        // Only the peer that served the request has a waiter.
        if let Some(tx) = self.pending.remove(&id) {
            let _ = tx.send(result);
        }
    }
}

struct ServerInner {
    member_id: u64,
    ids: IdGenerator,
    proposal_tx: mpsc::Sender<Vec<u8>>,
    action_tx: mpsc::UnboundedSender<Action>,
    max_request_bytes: usize,
    request_timeout: Duration,
}

/// Deregisters a pending request unless it completed.
struct PendingGuard<'a> {
    id: u64,
    actions: &'a mpsc::UnboundedSender<Action>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.actions.send(Action::Cancel { id: self.id });
        }
    }
}

/// KV RPC surface of one peer. Every request is proposed to the cluster and
/// answered once this peer applies it.
///
/// Dropping a returned future abandons the request; the entry is still
/// applied everywhere if it commits.
#[derive(Clone)]
pub struct KvServer {
    inner: Arc<ServerInner>,
}

fn unexpected(resp: InternalResponse) -> Error {
    Error::Internal(format!("mismatched response: {:?}", resp))
}

impl KvServer {
    pub fn member_id(&self) -> u64 {
        self.inner.member_id
    }

    pub async fn range(&self, req: RangeRequest) -> Result<RangeResponse> {
        match self.propose(InternalOp::Range(req)).await? {
            InternalResponse::Range(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub async fn put(&self, req: PutRequest) -> Result<PutResponse> {
        match self.propose(InternalOp::Put(req)).await? {
            InternalResponse::Put(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_range(&self, req: DeleteRangeRequest) -> Result<DeleteRangeResponse> {
        match self.propose(InternalOp::DeleteRange(req)).await? {
            InternalResponse::DeleteRange(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub async fn txn(&self, req: TxnRequest) -> Result<TxnResponse> {
        match self.propose(InternalOp::Txn(req)).await? {
            InternalResponse::Txn(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub async fn compact(&self, req: CompactionRequest) -> Result<CompactionResponse> {
        match self.propose(InternalOp::Compaction(req)).await? {
            InternalResponse::Compaction(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    /// Grant a lease. An ID of 0 is replaced by one chosen here, before
    /// proposing, so all peers apply the same ID.
    pub async fn lease_grant(&self, mut req: LeaseGrantRequest) -> Result<LeaseGrantResponse> {
        if req.id == 0 {
            req.id = (self.inner.ids.next() & i64::MAX as u64) as i64;
        }
        match self.propose(InternalOp::LeaseGrant(req)).await? {
            InternalResponse::LeaseGrant(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    pub async fn lease_revoke(&self, req: LeaseRevokeRequest) -> Result<LeaseRevokeResponse> {
        match self.propose(InternalOp::LeaseRevoke(req)).await? {
            InternalResponse::LeaseRevoke(r) => Ok(r),
            other => Err(unexpected(other)),
        }
    }

    /// Digest of the local store up to `revision`. Served locally, not
    /// through the log.
    pub async fn hash_kv(&self, revision: i64) -> Result<HashKvResponse> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .action_tx
            .send(Action::Hash { revision, tx })
            .map_err(|_| Error::Stopped)?;
        rx.await.map_err(|_| Error::Stopped)?
    }

    async fn propose(&self, op: InternalOp) -> Result<InternalResponse> {
        let inner = &self.inner;
        let id = inner.ids.next();
        let data = bincode::serialize(&InternalRequest { id, op })?;
        if data.len() > inner.max_request_bytes {
            return Err(Error::TooLarge {
                size: data.len(),
                max: inner.max_request_bytes,
            });
        }

        let (tx, rx) = oneshot::channel();
        inner
            .action_tx
            .send(Action::Register { id, tx })
            .map_err(|_| Error::Stopped)?;
        let mut guard = PendingGuard {
            id,
            actions: &inner.action_tx,
            armed: true,
        };

        let wait = async {
            if inner.proposal_tx.send(data).await.is_err() {
                return Err(Error::Stopped);
            }
            match rx.await {
                Ok(result) => {
                    guard.armed = false;
                    result
                }
                Err(_) => Err(Error::Stopped),
            }
        };

        match tokio::time::timeout(inner.request_timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled(format!(
                "request {:x} not applied within {:?}",
                id, inner.request_timeout
            ))),
        }
    }
}
