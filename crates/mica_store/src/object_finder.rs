//! Client-side cache of tablet and indexlet ownership.
//!
//! The finder maps `(table_id, key_hash)` and `(table_id, index_id, key)`
//! to a session on the owning master. Ownership is fetched lazily from the
//! coordinator through a `TableConfigFetcher` and cached until a flush;
//! the directory mutex is held across a refresh, so simultaneous misses
//! for one table coalesce into a single coordinator round-trip per
//! contended window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use mica_rpc::cluster::ServerId;
use mica_rpc::transport::SessionRef;
use mica_rpc::wrapper::RpcError;
use mica_rpc::Context;

use crate::key::{primary_key_hash, range_contains};

/// Interval between polls of the fetcher in the wait-for-state helpers.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// State of a tablet as reported by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TabletState {
    Normal,
    Recovering,
}

/// A contiguous `key_hash` range of one table, owned by one master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub table_id: u64,
    pub start_key_hash: u64,
    pub end_key_hash: u64,
    pub state: TabletState,
    pub server_id: ServerId,
}

/// Tablet plus the locator used to reach its master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletWithLocator {
    pub tablet: Tablet,
    pub service_locator: String,
}

/// One indexlet's directory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexletRecord {
    pub table_id: u64,
    pub index_id: u8,
    pub first_key: Vec<u8>,
    /// Empty means the range is unbounded above.
    pub first_not_owned_key: Vec<u8>,
    pub server_id: ServerId,
    pub service_locator: String,
}

/// Authoritative ownership snapshot for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub tablets: Vec<TabletWithLocator>,
    pub indexlets: Vec<IndexletRecord>,
}

/// Interface to the coordinator; mockable for tests.
#[async_trait]
pub trait TableConfigFetcher: Send + Sync {
    async fn get_table_config(&self, table_id: u64) -> Result<TableConfig, RpcError>;
}

/// Sort key for the tablet directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TabletKey {
    table_id: u64,
    start_key_hash: u64,
}

#[derive(Default)]
struct Directory {
    tablets: BTreeMap<TabletKey, TabletWithLocator>,
    indexlets: BTreeMap<(u64, u8), Vec<IndexletRecord>>,
}

impl Directory {
    fn find_tablet(&self, table_id: u64, key_hash: u64) -> Option<&TabletWithLocator> {
        let probe = TabletKey {
            table_id,
            start_key_hash: key_hash,
        };
        self.tablets
            .range(..=probe)
            .next_back()
            .map(|(_, tablet)| tablet)
            .filter(|entry| {
                entry.tablet.table_id == table_id && key_hash <= entry.tablet.end_key_hash
            })
    }

    fn find_indexlet(&self, table_id: u64, index_id: u8, key: &[u8]) -> Option<&IndexletRecord> {
        self.indexlets
            .get(&(table_id, index_id))?
            .iter()
            .find(|record| range_contains(&record.first_key, &record.first_not_owned_key, key))
    }

    fn evict_table(&mut self, table_id: u64) {
        self.tablets
            .retain(|key, _| key.table_id != table_id);
        self.indexlets.retain(|(id, _), _| *id != table_id);
    }

    fn absorb(&mut self, table_id: u64, config: TableConfig) {
        self.evict_table(table_id);
        for entry in config.tablets {
            self.tablets.insert(
                TabletKey {
                    table_id: entry.tablet.table_id,
                    start_key_hash: entry.tablet.start_key_hash,
                },
                entry,
            );
        }
        for record in config.indexlets {
            self.indexlets
                .entry((record.table_id, record.index_id))
                .or_default()
                .push(record);
        }
    }

    fn table_states(&self, table_id: u64) -> Vec<TabletState> {
        self.tablets
            .values()
            .filter(|entry| entry.tablet.table_id == table_id)
            .map(|entry| entry.tablet.state)
            .collect()
    }
}

/// The config cache: object and index-key routing for one client.
pub struct ObjectFinder {
    context: Arc<Context>,
    fetcher: Box<dyn TableConfigFetcher>,
    directory: Mutex<Directory>,
}

impl ObjectFinder {
    pub fn new(context: Arc<Context>, fetcher: Box<dyn TableConfigFetcher>) -> Self {
        Self {
            context,
            fetcher,
            directory: Mutex::new(Directory::default()),
        }
    }

    /// Session to the master owning the tablet that covers `key_hash`.
    pub async fn lookup_by_hash(
        &self,
        table_id: u64,
        key_hash: u64,
    ) -> Result<SessionRef, RpcError> {
        let entry = self
            .lookup_tablet(table_id, key_hash)
            .await?
            .ok_or(RpcError::TableDoesntExist)?;
        Ok(self
            .context
            .transport_manager
            .get_session(&entry.service_locator)?)
    }

    /// Session to the master owning the object named by `key`.
    pub async fn lookup(&self, table_id: u64, key: &[u8]) -> Result<SessionRef, RpcError> {
        self.lookup_by_hash(table_id, primary_key_hash(table_id, key))
            .await
    }

    /// Session to the master owning the indexlet that covers `key`, or
    /// `None` if the index does not exist: the caller treats that as a
    /// signal to cancel the RPC.
    pub async fn lookup_index(
        &self,
        table_id: u64,
        index_id: u8,
        key: &[u8],
    ) -> Result<Option<SessionRef>, RpcError> {
        let Some(record) = self.lookup_indexlet(table_id, index_id, key).await? else {
            return Ok(None);
        };
        Ok(Some(
            self.context
                .transport_manager
                .get_session(&record.service_locator)?,
        ))
    }

    /// Directory record for the tablet covering `key_hash`, refreshing on
    /// a miss. The returned record is a snapshot.
    pub async fn lookup_tablet(
        &self,
        table_id: u64,
        key_hash: u64,
    ) -> Result<Option<TabletWithLocator>, RpcError> {
        let mut directory = self.directory.lock().await;
        if let Some(entry) = directory.find_tablet(table_id, key_hash) {
            return Ok(Some(entry.clone()));
        }
        self.refresh(&mut directory, table_id).await?;
        Ok(directory.find_tablet(table_id, key_hash).cloned())
    }

    /// Directory record for the indexlet covering `key`, refreshing on a
    /// miss.
    pub async fn lookup_indexlet(
        &self,
        table_id: u64,
        index_id: u8,
        key: &[u8],
    ) -> Result<Option<IndexletRecord>, RpcError> {
        let mut directory = self.directory.lock().await;
        if let Some(record) = directory.find_indexlet(table_id, index_id, key) {
            return Ok(Some(record.clone()));
        }
        self.refresh(&mut directory, table_id).await?;
        Ok(directory.find_indexlet(table_id, index_id, key).cloned())
    }

    /// Evict every tablet and indexlet entry belonging to `table_id`.
    pub async fn flush(&self, table_id: u64) {
        tracing::debug!(table_id, "flushing table from config cache");
        self.directory.lock().await.evict_table(table_id);
    }

    /// After a transport failure, drop just the route that resolved
    /// `key_hash` along with its cached session.
    pub async fn flush_session(&self, table_id: u64, key_hash: u64) {
        let mut directory = self.directory.lock().await;
        let Some(entry) = directory.find_tablet(table_id, key_hash) else {
            return;
        };
        let locator = entry.service_locator.clone();
        let start_key_hash = entry.tablet.start_key_hash;
        directory.tablets.remove(&TabletKey {
            table_id,
            start_key_hash,
        });
        self.context.transport_manager.flush_session(&locator);
    }

    /// Index-routed variant of `flush_session`.
    pub async fn flush_index_session(&self, table_id: u64, index_id: u8, key: &[u8]) {
        let mut directory = self.directory.lock().await;
        let Some(record) = directory.find_indexlet(table_id, index_id, key) else {
            return;
        };
        let locator = record.service_locator.clone();
        let first_key = record.first_key.clone();
        if let Some(records) = directory.indexlets.get_mut(&(table_id, index_id)) {
            records.retain(|record| record.first_key != first_key);
        }
        self.context.transport_manager.flush_session(&locator);
    }

    /// Poll the coordinator until at least one tablet of `table_id` is
    /// outside the `Normal` state.
    pub async fn wait_for_tablet_down(&self, table_id: u64) -> Result<(), RpcError> {
        loop {
            {
                let mut directory = self.directory.lock().await;
                directory.evict_table(table_id);
                self.refresh(&mut directory, table_id).await?;
                if directory
                    .table_states(table_id)
                    .iter()
                    .any(|state| *state != TabletState::Normal)
                {
                    return Ok(());
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll the coordinator until every tablet of `table_id` is `Normal`,
    /// or fail with `TimedOut` once `timeout` elapses.
    pub async fn wait_for_all_tablets_normal(
        &self,
        table_id: u64,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut directory = self.directory.lock().await;
                directory.evict_table(table_id);
                self.refresh(&mut directory, table_id).await?;
                let states = directory.table_states(table_id);
                if !states.is_empty() && states.iter().all(|state| *state == TabletState::Normal) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(RpcError::TimedOut);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn refresh(&self, directory: &mut Directory, table_id: u64) -> Result<(), RpcError> {
        let config = self.fetcher.get_table_config(table_id).await?;
        tracing::debug!(
            table_id,
            tablets = config.tablets.len(),
            indexlets = config.indexlets.len(),
            "refreshed table config"
        );
        directory.absorb(table_id, config);
        Ok(())
    }
}
