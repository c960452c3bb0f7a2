//! Range-partitioned secondary indexes for the Mica key-value store.
//!
//! Masters hold every index partition (indexlet) in memory; this crate
//! provides both sides of the conversation about them. Server-side, the
//! `IndexletManager` registers indexlets and serves entry inserts, removes
//! and budgeted range scans, dispatched through `MasterService`.
//! Client-side, the `ObjectFinder` caches tablet and indexlet ownership
//! fetched lazily from the coordinator, and `master_client` wraps each
//! operation in the retryable RPC machinery from `mica_rpc`, converging
//! after migrations, splits and crashes.

pub mod indexlet;
pub mod indexlet_manager;
pub mod key;
pub mod master_client;
pub mod object_finder;
pub mod rpc_service;
pub mod tablet;

pub use indexlet::{IndexEntry, Indexlet, IndexletStore};
pub use indexlet_manager::{IndexKeyScan, IndexletManager};
pub use object_finder::{
    IndexletRecord, ObjectFinder, TableConfig, TableConfigFetcher, Tablet, TabletState,
    TabletWithLocator,
};
pub use rpc_service::MasterService;
pub use tablet::TabletManager;
