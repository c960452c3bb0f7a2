//! Host-side registry of the indexlets this master owns.
//!
//! The registry is keyed by `(table_id, index_id)`; one table's index can
//! be split across several indexlets on the same host as long as their key
//! ranges stay disjoint (enforced on insert). Lock order is registry map
//! first, then the found indexlet's store; the map lock is released before
//! a scan runs, so long scans on one indexlet never block registration
//! changes or operations on other indexlets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use mica_rpc::wire::Status;

use crate::indexlet::{IndexEntry, Indexlet};
use crate::key::key_compare;

/// Result of one budgeted indexlet scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexKeyScan {
    /// Primary key hashes in composite scan order.
    pub hashes: Vec<u64>,
    /// Where the next request should resume: either the first un-delivered
    /// entry (budget reached) or the next indexlet's first key with hash 0
    /// (range continues past this partition). `None` means the scan is
    /// complete.
    pub next_key: Option<(Vec<u8>, u64)>,
}

type IndexletMap = BTreeMap<(u64, u8), Vec<Arc<Indexlet>>>;

/// Registry plus dispatch point for index operations on this host.
pub struct IndexletManager {
    indexlet_map: Mutex<IndexletMap>,
}

impl IndexletManager {
    pub fn new() -> Self {
        Self {
            indexlet_map: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register an indexlet. Returns `false` if a registered indexlet for
    /// this `(table_id, index_id)` already covers `first_key`.
    pub fn add_indexlet(
        &self,
        table_id: u64,
        index_id: u8,
        storage_table_id: u64,
        first_key: &[u8],
        first_not_owned_key: &[u8],
    ) -> bool {
        let mut map = self.indexlet_map.lock().unwrap();
        if lookup_indexlet(&map, table_id, index_id, first_key).is_some() {
            return false;
        }
        map.entry((table_id, index_id))
            .or_default()
            .push(Arc::new(Indexlet::new(
                table_id,
                index_id,
                storage_table_id,
                first_key,
                first_not_owned_key,
            )));
        tracing::debug!(table_id, index_id, storage_table_id, "added indexlet");
        true
    }

    /// Drop an indexlet whose identifying keys match exactly, destroying
    /// its store. Returns `false` if no such indexlet is registered.
    pub fn delete_indexlet(
        &self,
        table_id: u64,
        index_id: u8,
        first_key: &[u8],
        first_not_owned_key: &[u8],
    ) -> bool {
        let mut map = self.indexlet_map.lock().unwrap();
        let Some(indexlets) = map.get_mut(&(table_id, index_id)) else {
            return false;
        };
        let Some(pos) = indexlets.iter().position(|indexlet| {
            indexlet.first_key == first_key && indexlet.first_not_owned_key == first_not_owned_key
        }) else {
            return false;
        };
        indexlets.remove(pos);
        if indexlets.is_empty() {
            map.remove(&(table_id, index_id));
        }
        tracing::debug!(table_id, index_id, "deleted indexlet");
        true
    }

    /// Exact-match lookup. The returned handle is a snapshot of the
    /// registration; the registry may change at any time afterwards.
    pub fn get_indexlet(
        &self,
        table_id: u64,
        index_id: u8,
        first_key: &[u8],
        first_not_owned_key: &[u8],
    ) -> Option<Arc<Indexlet>> {
        let map = self.indexlet_map.lock().unwrap();
        map.get(&(table_id, index_id))?
            .iter()
            .find(|indexlet| {
                indexlet.first_key == first_key
                    && indexlet.first_not_owned_key == first_not_owned_key
            })
            .cloned()
    }

    /// Total number of indexlets registered on this host.
    pub fn count(&self) -> usize {
        self.indexlet_map
            .lock()
            .unwrap()
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Insert an index entry, routed to the indexlet containing `key`.
    pub fn insert_entry(
        &self,
        table_id: u64,
        index_id: u8,
        key: &[u8],
        primary_key_hash: u64,
    ) -> Result<(), Status> {
        tracing::debug!(table_id, index_id, primary_key_hash, "inserting index entry");
        let map = self.indexlet_map.lock().unwrap();
        let Some(indexlet) = lookup_indexlet(&map, table_id, index_id, key) else {
            tracing::debug!(table_id, index_id, "insert routed to unknown indexlet");
            return Err(Status::UnknownIndexlet);
        };
        let mut store = indexlet.store();
        drop(map);

        store.insert(IndexEntry::new(key, primary_key_hash));
        Ok(())
    }

    /// Remove an index entry. Removing an entry that is absent still
    /// succeeds: the store tolerates garbage and removal is idempotent.
    pub fn remove_entry(
        &self,
        table_id: u64,
        index_id: u8,
        key: &[u8],
        primary_key_hash: u64,
    ) -> Result<(), Status> {
        tracing::debug!(table_id, index_id, primary_key_hash, "removing index entry");
        let map = self.indexlet_map.lock().unwrap();
        let Some(indexlet) = lookup_indexlet(&map, table_id, index_id, key) else {
            return Err(Status::UnknownIndexlet);
        };
        let mut store = indexlet.store();
        drop(map);

        if !store.erase_one(&IndexEntry::new(key, primary_key_hash)) {
            tracing::debug!(table_id, index_id, "remove matched no entry");
        }
        Ok(())
    }

    /// Scan the indexlet containing `first_key` for entries in the closed
    /// range `[first_key, last_key]`, starting at the composite position
    /// `(first_key, first_allowed_hash)` and appending at most
    /// `max_num_hashes` primary key hashes.
    pub fn lookup_index_keys(
        &self,
        table_id: u64,
        index_id: u8,
        first_key: &[u8],
        first_allowed_hash: u64,
        last_key: &[u8],
        max_num_hashes: u32,
    ) -> Result<IndexKeyScan, Status> {
        tracing::debug!(table_id, index_id, max_num_hashes, "looking up index keys");
        let map = self.indexlet_map.lock().unwrap();
        let Some(indexlet) = lookup_indexlet(&map, table_id, index_id, first_key) else {
            return Err(Status::UnknownIndexlet);
        };
        let store = indexlet.store();
        drop(map);

        // An empty store falls straight through the loop; the handoff
        // check below must still run so a scan can cross an empty
        // partition.
        let mut scan = IndexKeyScan::default();
        let start = IndexEntry::new(first_key, first_allowed_hash);
        let mut cursor = store.lower_bound(&start).peekable();
        let mut budget_reached = false;
        while let Some((entry, _)) = cursor.peek() {
            if key_compare(&entry.key, last_key) == std::cmp::Ordering::Greater {
                break;
            }
            if (scan.hashes.len() as u32) < max_num_hashes {
                scan.hashes.push(entry.primary_key_hash);
                cursor.next();
            } else {
                // The cursor still points at a live in-range entry, so the
                // continuation names the first un-delivered position and
                // nothing is re-emitted by the follow-up request.
                scan.next_key = Some((entry.key.clone(), entry.primary_key_hash));
                budget_reached = true;
                break;
            }
        }

        if !budget_reached
            && !indexlet.first_not_owned_key.is_empty()
            && key_compare(last_key, &indexlet.first_not_owned_key) == std::cmp::Ordering::Greater
        {
            // The requested range continues past this partition; hand the
            // client the next indexlet's first key.
            scan.next_key = Some((indexlet.first_not_owned_key.clone(), 0));
        }

        Ok(scan)
    }
}

impl Default for IndexletManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the registered indexlet whose range contains `key`. Deterministic
/// because ranges for one `(table_id, index_id)` are disjoint.
fn lookup_indexlet(
    map: &IndexletMap,
    table_id: u64,
    index_id: u8,
    key: &[u8],
) -> Option<Arc<Indexlet>> {
    map.get(&(table_id, index_id))?
        .iter()
        .find(|indexlet| indexlet.contains(key))
        .cloned()
}
