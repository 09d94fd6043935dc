//! Lessor: lease bookkeeping
//!
//! Leases bind a TTL to an ID and track the keys attached to them. State
//! changes only by applying committed entries, so every peer holds the same
//! leases. TTLs are recorded but never expire on their own.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Shortest TTL a lease is granted with
pub const MIN_LEASE_TTL: i64 = 5;

/// Persisted form of a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRow {
    pub id: i64,
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    pub ttl: i64,
    keys: BTreeSet<Vec<u8>>,
}

impl Lease {
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.keys.iter().map(Vec::as_slice)
    }
}

#[derive(Debug, Default)]
pub struct Lessor {
    leases: BTreeMap<i64, Lease>,
}

impl Lessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new lease. TTLs below [`MIN_LEASE_TTL`] are raised to it.
    pub fn grant(&mut self, id: i64, ttl: i64) -> Result<LeaseRow> {
        if id <= 0 {
            return Err(Error::LeaseNotFound(id));
        }
        if self.leases.contains_key(&id) {
            return Err(Error::LeaseExists(id));
        }
        let ttl = ttl.max(MIN_LEASE_TTL);
        self.leases.insert(
            id,
            Lease {
                id,
                ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(LeaseRow { id, ttl })
    }

    /// Forget a lease; returns the keys that were attached to it.
    pub fn revoke(&mut self, id: i64) -> Result<Vec<Vec<u8>>> {
        let lease = self.leases.remove(&id).ok_or(Error::LeaseNotFound(id))?;
        Ok(lease.keys.into_iter().collect())
    }

    pub fn lookup(&self, id: i64) -> Option<&Lease> {
        self.leases.get(&id)
    }

    pub fn attach(&mut self, id: i64, key: &[u8]) -> Result<()> {
        let lease = self.leases.get_mut(&id).ok_or(Error::LeaseNotFound(id))?;
        lease.keys.insert(key.to_vec());
        Ok(())
    }

    /// Detach `key`; a no-op if the lease is gone.
    pub fn detach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_revoke() {
        let mut lessor = Lessor::new();
        let row = lessor.grant(7, 1).unwrap();
        assert_eq!(row, LeaseRow { id: 7, ttl: MIN_LEASE_TTL });
        assert!(matches!(lessor.grant(7, 10), Err(Error::LeaseExists(7))));

        lessor.attach(7, b"a").unwrap();
        lessor.attach(7, b"b").unwrap();
        lessor.detach(7, b"a");
        assert_eq!(lessor.lookup(7).unwrap().keys().count(), 1);

        let keys = lessor.revoke(7).unwrap();
        assert_eq!(keys, vec![b"b".to_vec()]);
        assert!(lessor.is_empty());
        assert!(matches!(lessor.revoke(7), Err(Error::LeaseNotFound(7))));
    }

    #[test]
    fn test_attach_unknown_lease() {
        let mut lessor = Lessor::new();
        assert!(matches!(lessor.attach(3, b"k"), Err(Error::LeaseNotFound(3))));
        lessor.detach(3, b"k");
    }
}
