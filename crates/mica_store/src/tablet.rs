//! Server-side registry of the tablets this master owns.
//!
//! A tablet is a contiguous `key_hash` range of one table. The registry
//! only tracks ownership; object data itself lives in the log-structured
//! engine, which is not this crate's concern.

use std::collections::BTreeMap;
use std::sync::Mutex;

use mica_rpc::wire::Status;

/// One owned hash range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnedTablet {
    pub table_id: u64,
    pub start_key_hash: u64,
    pub end_key_hash: u64,
}

/// Ownership registry keyed by `(table_id, start_key_hash)`.
pub struct TabletManager {
    tablets: Mutex<BTreeMap<(u64, u64), OwnedTablet>>,
}

impl TabletManager {
    pub fn new() -> Self {
        Self {
            tablets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Accept ownership of a tablet. Taking a tablet this master already
    /// owns with the same bounds succeeds; a range overlapping a different
    /// registration is rejected.
    pub fn take_tablet_ownership(
        &self,
        table_id: u64,
        start_key_hash: u64,
        end_key_hash: u64,
    ) -> Result<(), Status> {
        let mut tablets = self.tablets.lock().unwrap();
        for tablet in tablets.values() {
            if tablet.table_id != table_id {
                continue;
            }
            if *tablet
                == (OwnedTablet {
                    table_id,
                    start_key_hash,
                    end_key_hash,
                })
            {
                return Ok(());
            }
            if start_key_hash <= tablet.end_key_hash && tablet.start_key_hash <= end_key_hash {
                tracing::warn!(
                    table_id,
                    start_key_hash,
                    end_key_hash,
                    "rejecting overlapping tablet ownership"
                );
                return Err(Status::InternalError);
            }
        }
        tablets.insert(
            (table_id, start_key_hash),
            OwnedTablet {
                table_id,
                start_key_hash,
                end_key_hash,
            },
        );
        tracing::debug!(table_id, start_key_hash, end_key_hash, "took tablet ownership");
        Ok(())
    }

    /// Release a tablet registered with exactly these bounds.
    pub fn drop_tablet_ownership(
        &self,
        table_id: u64,
        start_key_hash: u64,
        end_key_hash: u64,
    ) -> Result<(), Status> {
        let mut tablets = self.tablets.lock().unwrap();
        match tablets.get(&(table_id, start_key_hash)) {
            Some(tablet) if tablet.end_key_hash == end_key_hash => {
                tablets.remove(&(table_id, start_key_hash));
                tracing::debug!(table_id, start_key_hash, "dropped tablet ownership");
                Ok(())
            }
            _ => Err(Status::UnknownTablet),
        }
    }

    /// Whether this master owns the tablet covering `key_hash`.
    pub fn owns(&self, table_id: u64, key_hash: u64) -> bool {
        self.tablets
            .lock()
            .unwrap()
            .range(..=(table_id, key_hash))
            .next_back()
            .map(|(_, tablet)| tablet.table_id == table_id && key_hash <= tablet.end_key_hash)
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.tablets.lock().unwrap().len()
    }
}

impl Default for TabletManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_drop_and_containment() {
        let manager = TabletManager::new();
        manager.take_tablet_ownership(1, 0, 999).unwrap();
        assert!(manager.owns(1, 0));
        assert!(manager.owns(1, 999));
        assert!(!manager.owns(1, 1000));
        assert!(!manager.owns(2, 5));

        assert_eq!(
            manager.drop_tablet_ownership(1, 0, 998),
            Err(Status::UnknownTablet)
        );
        manager.drop_tablet_ownership(1, 0, 999).unwrap();
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn overlap_rejected_but_retake_is_idempotent() {
        let manager = TabletManager::new();
        manager.take_tablet_ownership(1, 0, 999).unwrap();
        manager.take_tablet_ownership(1, 0, 999).unwrap();
        assert_eq!(
            manager.take_tablet_ownership(1, 500, 1500),
            Err(Status::InternalError)
        );
        manager.take_tablet_ownership(1, 1000, 1500).unwrap();
        assert_eq!(manager.count(), 2);
    }
}
