//! In-memory key index
//!
//! Maps each user key to the revisions that touched it, grouped into
//! generations. A generation runs from a key's creation to its deletion; the
//! deletion (tombstone) is the last revision of a closed generation.

use crate::common::key_in_range;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// A store revision. `main` is bumped once per write transaction; `sub`
/// orders the changes inside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

/// Encoded length of a revision: `main` (8) + `_` + `sub` (8)
pub const REV_BYTES_LEN: usize = 17;
/// Encoded length of a tombstone revision: revision + `t`
pub const MARKED_REV_BYTES_LEN: usize = REV_BYTES_LEN + 1;

impl Revision {
    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }

    /// Big-endian encoding; byte order matches revision order.
    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MARKED_REV_BYTES_LEN);
        out.extend_from_slice(&self.main.to_be_bytes());
        out.push(b'_');
        out.extend_from_slice(&self.sub.to_be_bytes());
        out
    }

    pub fn to_tombstone_bytes(self) -> Vec<u8> {
        let mut out = self.to_bytes();
        out.push(b't');
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < REV_BYTES_LEN || bytes[8] != b'_' {
            return None;
        }
        let main = i64::from_be_bytes(bytes[0..8].try_into().ok()?);
        let sub = i64::from_be_bytes(bytes[9..17].try_into().ok()?);
        Some(Self { main, sub })
    }
}

pub fn is_tombstone_bytes(bytes: &[u8]) -> bool {
    bytes.len() == MARKED_REV_BYTES_LEN && bytes[REV_BYTES_LEN] == b't'
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Generation {
    ver: i64,
    created: Revision,
    revs: Vec<Revision>,
}

impl Generation {
    fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Index of the newest revision with `main <= at`
    fn latest_at(&self, at: i64) -> Option<usize> {
        self.revs.iter().rposition(|r| r.main <= at)
    }
}

/// Where a key stood at some revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyState {
    pub modified: Revision,
    pub created: Revision,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyIndex {
    generations: Vec<Generation>,
}

impl KeyIndex {
    fn new() -> Self {
        Self {
            generations: vec![Generation::default()],
        }
    }

    fn put(&mut self, rev: Revision) {
        match self.generations.last_mut() {
            Some(g) => {
                if g.is_empty() {
                    g.created = rev;
                }
                g.revs.push(rev);
                g.ver += 1;
            }
            None => self.generations.push(Generation {
                ver: 1,
                created: rev,
                revs: vec![rev],
            }),
        }
    }

    /// Returns false if the key is not live.
    fn tombstone(&mut self, rev: Revision) -> bool {
        match self.generations.last() {
            Some(g) if !g.is_empty() => {}
            _ => return false,
        }
        self.put(rev);
        self.generations.push(Generation::default());
        true
    }

    fn is_empty(&self) -> bool {
        self.generations.len() == 1 && self.generations[0].is_empty()
    }

    /// The generation live at `at`, if any
    fn find_generation(&self, at: i64) -> Option<&Generation> {
        let last = self.generations.len().checked_sub(1)?;
        for (i, g) in self.generations.iter().enumerate().rev() {
            if g.is_empty() {
                continue;
            }
            // Closed generations end with their tombstone.
            if i != last {
                let tomb = g.revs[g.revs.len() - 1];
                if tomb.main <= at {
                    return None;
                }
            }
            if g.revs[0].main <= at {
                return Some(g);
            }
        }
        None
    }

    fn get(&self, at: i64) -> Option<KeyState> {
        let g = self.find_generation(at)?;
        let n = g.latest_at(at)?;
        Some(KeyState {
            modified: g.revs[n],
            created: g.created,
            version: g.ver - (g.revs.len() - n - 1) as i64,
        })
    }

    /// Drop history older than `at`, keeping the newest revision at or below
    /// it so reads at `at` still resolve. Kept revisions go into `available`.
    fn compact(&mut self, at: i64, available: &mut BTreeSet<Revision>) {
        let mut gen_idx = 0;
        while gen_idx + 1 < self.generations.len() {
            let g = &self.generations[gen_idx];
            if let Some(tomb) = g.revs.last() {
                if tomb.main > at {
                    break;
                }
            }
            gen_idx += 1;
        }

        let last = self.generations.len() - 1;
        let g = &mut self.generations[gen_idx];
        if !g.is_empty() {
            if let Some(n) = g.latest_at(at) {
                available.insert(g.revs[n]);
                g.revs.drain(..n);
            }
            // A generation reduced to its tombstone is gone entirely.
            if g.revs.len() == 1 && gen_idx != last {
                available.remove(&g.revs[0]);
                gen_idx += 1;
            }
        }
        self.generations.drain(..gen_idx);
    }
}

/// Ordered index over all keys
#[derive(Debug, Default)]
pub struct TreeIndex {
    tree: BTreeMap<Vec<u8>, KeyIndex>,
}

impl TreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], rev: Revision) {
        self.tree
            .entry(key.to_vec())
            .or_insert_with(KeyIndex::new)
            .put(rev);
    }

    /// Record a deletion; false if the key was not live.
    pub fn tombstone(&mut self, key: &[u8], rev: Revision) -> bool {
        match self.tree.get_mut(key) {
            Some(ki) => ki.tombstone(rev),
            None => false,
        }
    }

    pub fn get(&self, key: &[u8], at: i64) -> Option<KeyState> {
        self.tree.get(key).and_then(|ki| ki.get(at))
    }

    /// Keys live at `at` within `[key, range_end)`, ascending
    pub fn range(&self, key: &[u8], range_end: &[u8], at: i64) -> Vec<(Vec<u8>, KeyState)> {
        if range_end.is_empty() {
            return self
                .get(key, at)
                .map(|state| vec![(key.to_vec(), state)])
                .unwrap_or_default();
        }
        self.tree
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .take_while(|(k, _)| key_in_range(k, key, Some(range_end)))
            .filter_map(|(k, ki)| ki.get(at).map(|state| (k.clone(), state)))
            .collect()
    }

    /// Compact every key at `at`; returns the revisions still referenced.
    pub fn compact(&mut self, at: i64) -> BTreeSet<Revision> {
        let mut available = BTreeSet::new();
        self.tree.retain(|_, ki| {
            ki.compact(at, &mut available);
            !ki.is_empty() && !ki.generations.is_empty()
        });
        available
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
