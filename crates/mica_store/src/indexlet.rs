//! A single range partition (indexlet) of one secondary index.

use std::collections::btree_map::{self, BTreeMap};
use std::sync::{Mutex, MutexGuard};

use crate::key::range_contains;

/// One `(key, primary key hash)` pair. The derived order is the composite
/// scan order: key bytes lexicographically, then hash ascending, so entries
/// with the same key and different hashes coexist.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub primary_key_hash: u64,
}

impl IndexEntry {
    pub fn new(key: impl Into<Vec<u8>>, primary_key_hash: u64) -> Self {
        Self {
            key: key.into(),
            primary_key_hash,
        }
    }
}

/// Ordered store backing one indexlet. The value duplicates the hash held
/// in the entry so a removal needs no second lookup. Because the hash is
/// part of the composite key, inserting an identical `(key, hash)` pair is
/// idempotent.
#[derive(Debug, Default)]
pub struct IndexletStore {
    entries: BTreeMap<IndexEntry, u64>,
}

impl IndexletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn insert(&mut self, entry: IndexEntry) {
        let hash = entry.primary_key_hash;
        self.entries.insert(entry, hash);
    }

    /// Remove at most one matching entry; removal of a missing entry is
    /// not an error (the store may contain garbage).
    pub fn erase_one(&mut self, entry: &IndexEntry) -> bool {
        self.entries.remove(entry).is_some()
    }

    /// Iterate entries `>= entry` in composite order.
    pub fn lower_bound(&self, entry: &IndexEntry) -> btree_map::Range<'_, IndexEntry, u64> {
        self.entries.range(entry.clone()..)
    }
}

/// An index partition owning `[first_key, first_not_owned_key)` together
/// with its entry store. The per-store mutex serializes all mutating and
/// scanning operations on this indexlet; readers never observe a partial
/// insert.
#[derive(Debug)]
pub struct Indexlet {
    pub table_id: u64,
    pub index_id: u8,
    /// Backing table that would hold this indexlet's tree nodes.
    pub storage_table_id: u64,
    pub first_key: Vec<u8>,
    /// Empty means the range is unbounded above.
    pub first_not_owned_key: Vec<u8>,
    store: Mutex<IndexletStore>,
}

impl Indexlet {
    pub fn new(
        table_id: u64,
        index_id: u8,
        storage_table_id: u64,
        first_key: impl Into<Vec<u8>>,
        first_not_owned_key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            table_id,
            index_id,
            storage_table_id,
            first_key: first_key.into(),
            first_not_owned_key: first_not_owned_key.into(),
            store: Mutex::new(IndexletStore::new()),
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        range_contains(&self.first_key, &self.first_not_owned_key, key)
    }

    /// Lock the entry store for a mutation or scan.
    pub fn store(&self) -> MutexGuard<'_, IndexletStore> {
        self.store.lock().unwrap()
    }
}
