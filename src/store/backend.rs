//! Store backends
//!
//! Bucketed ordered byte maps with atomic batch commit. `MemBackend` keeps
//! everything in BTreeMaps; `RocksBackend` uses one column family per bucket
//! in a temporary directory that is removed when the backend is dropped.

use crate::common::{BackendKind, Error, Result};
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::ops::Bound;
use tempfile::TempDir;

const CF_KEY: &str = "key";
const CF_LEASE: &str = "lease";
const CF_META: &str = "meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Bucket {
    /// Revision → KeyValue
    Key,
    /// Lease ID → lease row
    Lease,
    /// Bookkeeping rows (consistent index, compaction)
    Meta,
}

impl Bucket {
    fn cf_name(self) -> &'static str {
        match self {
            Bucket::Key => CF_KEY,
            Bucket::Lease => CF_LEASE,
            Bucket::Meta => CF_META,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchOp {
    Put(Bucket, Vec<u8>, Vec<u8>),
    Delete(Bucket, Vec<u8>),
}

/// Writes committed together
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, bucket: Bucket, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(bucket, key.into(), value.into()));
    }

    pub fn delete(&mut self, bucket: Bucket, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(bucket, key.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Storage engine behind the MVCC store
pub trait Backend: Send {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Entries with `start <= key < end` in ascending key order; `None` is
    /// unbounded.
    fn scan(&self, bucket: Bucket, start: &[u8], end: Option<&[u8]>)
        -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every op of `batch` or none of them.
    fn commit(&mut self, batch: WriteBatch) -> Result<()>;

    fn kind(&self) -> BackendKind;
}

/// Open a fresh, empty backend of the given kind.
pub fn open(kind: BackendKind) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Memory => Ok(Box::new(MemBackend::new())),
        BackendKind::Rocksdb => Ok(Box::new(RocksBackend::open_temp()?)),
    }
}

/// In-memory backend (default)
#[derive(Debug, Default)]
pub struct MemBackend {
    buckets: BTreeMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemBackend {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .buckets
            .get(&bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn scan(
        &self,
        bucket: Bucket,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(map) = self.buckets.get(&bucket) else {
            return Ok(Vec::new());
        };
        let upper = match end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        if let Some(end) = end {
            if end <= start {
                return Ok(Vec::new());
            }
        }
        Ok(map
            .range::<[u8], _>((Bound::Included(start), upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<()> {
        for op in batch.ops {
            match op {
                BatchOp::Put(bucket, key, value) => {
                    self.buckets.entry(bucket).or_default().insert(key, value);
                }
                BatchOp::Delete(bucket, key) => {
                    if let Some(map) = self.buckets.get_mut(&bucket) {
                        map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

/// RocksDB backend in a private temporary directory
pub struct RocksBackend {
    // Field order matters: the DB must close before its directory goes.
    db: DB,
    dir: TempDir,
}

impl RocksBackend {
    pub fn open_temp() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("meshkv-").tempdir()?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, dir.path(), vec![CF_KEY, CF_LEASE, CF_META])?;
        tracing::debug!(path = %dir.path().display(), "backend: opened rocksdb");

        Ok(Self { db, dir })
    }

    fn cf(&self, bucket: Bucket) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(bucket.cf_name())
            .ok_or_else(|| Error::Backend(format!("missing column family {}", bucket.cf_name())))
    }
}

impl Backend for RocksBackend {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(bucket)?;
        Ok(self.db.get_cf(cf, key)?)
    }

    fn scan(
        &self,
        bucket: Bucket,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(bucket)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if let Some(end) = end {
                if key.as_ref() >= end {
                    break;
                }
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<()> {
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(bucket, key, value) => wb.put_cf(self.cf(bucket)?, key, value),
                BatchOp::Delete(bucket, key) => wb.delete_cf(self.cf(bucket)?, key),
            }
        }
        self.db.write(wb)?;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Rocksdb
    }
}

impl Drop for RocksBackend {
    fn drop(&mut self) {
        tracing::debug!(path = %self.dir.path().display(), "backend: removing rocksdb");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(backend: &mut dyn Backend) {
        let mut batch = WriteBatch::new();
        batch.put(Bucket::Key, b"a".to_vec(), b"1".to_vec());
        batch.put(Bucket::Key, b"b".to_vec(), b"2".to_vec());
        batch.put(Bucket::Key, b"c".to_vec(), b"3".to_vec());
        batch.put(Bucket::Meta, b"a".to_vec(), b"meta".to_vec());
        backend.commit(batch).unwrap();

        assert_eq!(backend.get(Bucket::Key, b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(backend.get(Bucket::Lease, b"b").unwrap(), None);

        let all = backend.scan(Bucket::Key, b"", None).unwrap();
        assert_eq!(all.len(), 3);

        let some = backend.scan(Bucket::Key, b"b", Some(b"c")).unwrap();
        assert_eq!(some, vec![(b"b".to_vec(), b"2".to_vec())]);

        let mut batch = WriteBatch::new();
        batch.delete(Bucket::Key, b"a".to_vec());
        backend.commit(batch).unwrap();
        assert_eq!(backend.get(Bucket::Key, b"a").unwrap(), None);
        assert_eq!(backend.get(Bucket::Meta, b"a").unwrap(), Some(b"meta".to_vec()));
    }

    #[test]
    fn test_mem_backend() {
        let mut backend = MemBackend::new();
        exercise(&mut backend);
    }

    #[test]
    fn test_rocks_backend_removes_directory() {
        let mut backend = RocksBackend::open_temp().unwrap();
        let path = backend.dir.path().to_path_buf();
        exercise(&mut backend);
        assert!(path.exists());
        drop(backend);
        assert!(!path.exists());
    }
}
