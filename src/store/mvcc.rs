//! Multi-version KV store
//!
//! Every mutation is written under a new revision and the previous versions
//! stay readable until compacted. Writes happen inside a [`TxnWrite`]: all of
//! its changes share one main revision and commit to the backend in a single
//! batch together with the consistent-index row.

use super::backend::{Backend, Bucket, WriteBatch};
use super::index::{KeyState, Revision, TreeIndex};
use super::types::KeyValue;
use crate::common::{Error, Result};
use std::collections::BTreeMap;

/// Meta row holding the index of the last applied log entry
pub const CONSISTENT_INDEX_KEY: &[u8] = b"consistent_index";
/// Meta row holding the last finished compaction revision
pub const FINISHED_COMPACT_KEY: &[u8] = b"finished_compact_rev";

/// Result of a range read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// Matching keys before `limit`
    pub count: usize,
    /// Revision the read was served at
    pub rev: i64,
}

pub struct MvccStore {
    backend: Box<dyn Backend>,
    index: TreeIndex,
    current_rev: i64,
    compact_rev: i64,
}

impl MvccStore {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            index: TreeIndex::new(),
            current_rev: 1,
            compact_rev: -1,
        }
    }

    /// Last committed main revision
    pub fn rev(&self) -> i64 {
        self.current_rev
    }

    /// Last compacted revision, `-1` if never compacted
    pub fn compact_rev(&self) -> i64 {
        self.compact_rev
    }

    /// Index of the last log entry whose writes reached the backend
    pub fn consistent_index(&self) -> Result<u64> {
        match self.backend.get(Bucket::Meta, CONSISTENT_INDEX_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Backend("corrupt consistent index".into()))?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Was the entry at `index` already applied to the backend?
    fn already_applied(&self, index: u64) -> Result<bool> {
        Ok(index != 0 && self.consistent_index()? >= index)
    }

    /// Read `[key, range_end)` at `rev` (`<= 0` reads the current revision).
    pub fn range(&self, key: &[u8], range_end: &[u8], limit: usize, rev: i64) -> Result<RangeResult> {
        self.range_keys(key, range_end, limit, rev, self.current_rev, None)
    }

    /// Begin a write transaction for the log entry at `index`. If that entry
    /// already reached the backend the transaction is skipped: reads work,
    /// writes are no-ops.
    pub fn write(&mut self, index: u64) -> Result<TxnWrite<'_>> {
        let skip = self.already_applied(index)?;
        if skip {
            tracing::debug!(index, "mvcc: entry already applied, skipping writes");
        }
        Ok(TxnWrite {
            store: self,
            index,
            skip,
            changes: Vec::new(),
            pending: BTreeMap::new(),
            batch: WriteBatch::new(),
        })
    }

    /// Drop history below `rev`. Reads at `rev` and later are unaffected.
    pub fn compact(&mut self, rev: i64, index: u64) -> Result<()> {
        if self.already_applied(index)? {
            return Ok(());
        }
        if rev <= self.compact_rev {
            return Err(Error::Compacted);
        }
        if rev > self.current_rev {
            return Err(Error::FutureRevision);
        }

        let available = self.index.compact(rev);
        let mut batch = WriteBatch::new();
        let end = Revision::new(rev + 1, 0).to_bytes();
        let mut dropped = 0usize;
        for (key, _) in self.backend.scan(Bucket::Key, &[], Some(&end))? {
            match Revision::from_bytes(&key) {
                Some(r) if available.contains(&r) => {}
                _ => {
                    batch.delete(Bucket::Key, key);
                    dropped += 1;
                }
            }
        }
        batch.put(Bucket::Meta, FINISHED_COMPACT_KEY, rev.to_be_bytes().to_vec());
        put_consistent_index(&mut batch, index);
        self.backend.commit(batch)?;
        self.compact_rev = rev;

        tracing::info!(rev, dropped, "mvcc: compacted");
        Ok(())
    }

    /// Digest of every stored revision up to `rev` (`<= 0`: current).
    pub fn hash_kv(&self, rev: i64) -> Result<(blake3::Hash, i64)> {
        let rev = if rev <= 0 { self.current_rev } else { rev };
        if rev > self.current_rev {
            return Err(Error::FutureRevision);
        }
        let end = Revision::new(rev + 1, 0).to_bytes();
        let mut hasher = blake3::Hasher::new();
        for (key, value) in self.backend.scan(Bucket::Key, &[], Some(&end))? {
            hasher.update(&key);
            hasher.update(&value);
        }
        Ok((hasher.finalize(), rev))
    }

    fn range_keys(
        &self,
        key: &[u8],
        range_end: &[u8],
        limit: usize,
        rev: i64,
        cur_rev: i64,
        pending: Option<&BTreeMap<Revision, KeyValue>>,
    ) -> Result<RangeResult> {
        let rev = if rev <= 0 { cur_rev } else { rev };
        if rev > cur_rev {
            return Err(Error::FutureRevision);
        }
        if rev < self.compact_rev {
            return Err(Error::Compacted);
        }

        let states = self.index.range(key, range_end, rev);
        let count = states.len();
        let take = if limit > 0 { limit.min(count) } else { count };

        let mut kvs = Vec::with_capacity(take);
        for (_, state) in states.into_iter().take(take) {
            kvs.push(self.fetch(&state, pending)?);
        }
        Ok(RangeResult { kvs, count, rev })
    }

    fn fetch(&self, state: &KeyState, pending: Option<&BTreeMap<Revision, KeyValue>>) -> Result<KeyValue> {
        if let Some(kv) = pending.and_then(|p| p.get(&state.modified)) {
            return Ok(kv.clone());
        }
        let bytes = self
            .backend
            .get(Bucket::Key, &state.modified.to_bytes())?
            .ok_or_else(|| {
                Error::Backend(format!(
                    "revision {}_{} missing from backend",
                    state.modified.main, state.modified.sub
                ))
            })?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

fn put_consistent_index(batch: &mut WriteBatch, index: u64) {
    if index != 0 {
        batch.put(Bucket::Meta, CONSISTENT_INDEX_KEY, index.to_be_bytes().to_vec());
    }
}

/// Write transaction. Holding it borrows the store exclusively.
pub struct TxnWrite<'a> {
    store: &'a mut MvccStore,
    index: u64,
    skip: bool,
    changes: Vec<KeyValue>,
    pending: BTreeMap<Revision, KeyValue>,
    batch: WriteBatch,
}

impl TxnWrite<'_> {
    /// True if the entry was applied before and writes are ignored
    pub fn is_skipped(&self) -> bool {
        self.skip
    }

    fn main_rev(&self) -> i64 {
        self.store.current_rev + 1
    }

    fn next_rev(&self) -> Revision {
        Revision::new(self.main_rev(), self.changes.len() as i64)
    }

    /// Revision as seen inside the transaction
    pub fn rev(&self) -> i64 {
        if self.changes.is_empty() {
            self.store.current_rev
        } else {
            self.main_rev()
        }
    }

    /// Read, including this transaction's own writes.
    pub fn range(&self, key: &[u8], range_end: &[u8], limit: usize, rev: i64) -> Result<RangeResult> {
        self.store
            .range_keys(key, range_end, limit, rev, self.rev(), Some(&self.pending))
    }

    /// Current value of `key`, if live
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyValue>> {
        match self.store.index.get(key, self.main_rev()) {
            Some(state) => Ok(Some(self.store.fetch(&state, Some(&self.pending))?)),
            None => Ok(None),
        }
    }

    /// Write `key`; returns the previous value.
    pub fn put(&mut self, key: &[u8], value: &[u8], lease: i64) -> Result<Option<KeyValue>> {
        if self.skip {
            return Ok(None);
        }
        let rev = self.next_rev();
        let prev = self.get(key)?;
        let (create_revision, version) = match &prev {
            Some(p) => (p.create_revision, p.version + 1),
            None => (rev.main, 1),
        };
        let kv = KeyValue {
            key: key.to_vec(),
            create_revision,
            mod_revision: rev.main,
            version,
            value: value.to_vec(),
            lease,
        };

        self.batch.put(Bucket::Key, rev.to_bytes(), bincode::serialize(&kv)?);
        self.store.index.put(key, rev);
        self.pending.insert(rev, kv.clone());
        self.changes.push(kv);
        Ok(prev)
    }

    /// Delete every live key in `[key, range_end)`; returns the deleted values.
    pub fn delete_range(&mut self, key: &[u8], range_end: &[u8]) -> Result<Vec<KeyValue>> {
        if self.skip {
            return Ok(Vec::new());
        }
        let states = self.store.index.range(key, range_end, self.main_rev());
        let mut deleted = Vec::with_capacity(states.len());
        for (key, state) in states {
            deleted.push(self.store.fetch(&state, Some(&self.pending))?);
            self.delete(&key)?;
        }
        Ok(deleted)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let rev = self.next_rev();
        let tombstone = KeyValue {
            key: key.to_vec(),
            mod_revision: rev.main,
            ..Default::default()
        };
        if !self.store.index.tombstone(key, rev) {
            return Ok(());
        }
        self.batch
            .put(Bucket::Key, rev.to_tombstone_bytes(), bincode::serialize(&tombstone)?);
        self.changes.push(tombstone);
        Ok(())
    }

    /// Stage a lease row alongside the key writes.
    pub fn put_lease_row(&mut self, id: i64, row: Vec<u8>) {
        if !self.skip {
            self.batch.put(Bucket::Lease, id.to_be_bytes().to_vec(), row);
        }
    }

    pub fn delete_lease_row(&mut self, id: i64) {
        if !self.skip {
            self.batch.delete(Bucket::Lease, id.to_be_bytes().to_vec());
        }
    }

    /// Commit and return the store revision after the transaction.
    pub fn end(mut self) -> Result<i64> {
        if self.skip {
            return Ok(self.store.current_rev);
        }
        put_consistent_index(&mut self.batch, self.index);
        let batch = std::mem::take(&mut self.batch);
        self.store.backend.commit(batch)?;
        if !self.changes.is_empty() {
            self.store.current_rev += 1;
            tracing::trace!(
                rev = self.store.current_rev,
                changes = self.changes.len(),
                "mvcc: committed"
            );
        }
        Ok(self.store.current_rev)
    }
}
