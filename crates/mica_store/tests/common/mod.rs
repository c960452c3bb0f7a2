//! Shared helpers for integration tests: an in-process cluster of master
//! services wired together over the bind transport, plus a scriptable
//! coordinator snapshot.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mica_rpc::bind::BindTransport;
use mica_rpc::cluster::ServerId;
use mica_rpc::transport::Transport;
use mica_rpc::wire::ServiceType;
use mica_rpc::wrapper::RpcError;
use mica_rpc::Context;
use mica_store::object_finder::{
    IndexletRecord, ObjectFinder, TableConfig, TableConfigFetcher, Tablet, TabletState,
    TabletWithLocator,
};
use mica_store::rpc_service::MasterService;

/// Scriptable stand-in for the coordinator's table configuration.
#[derive(Clone)]
pub struct Coordinator {
    configs: Arc<Mutex<BTreeMap<u64, TableConfig>>>,
    calls: Arc<AtomicU64>,
}

impl Coordinator {
    fn new() -> Self {
        Self {
            configs: Arc::new(Mutex::new(BTreeMap::new())),
            calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the authoritative snapshot for `table_id`.
    pub fn set_table_config(&self, table_id: u64, config: TableConfig) {
        self.configs.lock().unwrap().insert(table_id, config);
    }

    /// Number of `get_table_config` round-trips served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TableConfigFetcher for Coordinator {
    async fn get_table_config(&self, table_id: u64) -> Result<TableConfig, RpcError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .configs
            .lock()
            .unwrap()
            .get(&table_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// An in-process cluster: bind transport, N master services, a client
/// context and an object finder fed by the scriptable coordinator.
pub struct Cluster {
    pub context: Arc<Context>,
    pub transport: BindTransport,
    pub finder: Arc<ObjectFinder>,
    pub coordinator: Coordinator,
    masters: BTreeMap<ServerId, Arc<MasterService>>,
}

impl Cluster {
    pub fn new(num_masters: usize) -> Self {
        init_tracing();
        let context = Context::new();
        let transport = BindTransport::new();
        let mut masters = BTreeMap::new();
        for id in 1..=num_masters as ServerId {
            let master = Arc::new(MasterService::new());
            transport.add_service(&locator(id), ServiceType::Master, master.clone());
            context.server_list.add(id, locator(id));
            masters.insert(id, master);
        }
        context
            .transport_manager
            .register("mock:", Arc::new(transport.clone()) as Arc<dyn Transport>);
        let coordinator = Coordinator::new();
        let finder = Arc::new(ObjectFinder::new(
            context.clone(),
            Box::new(coordinator.clone()),
        ));
        Self {
            context,
            transport,
            finder,
            coordinator,
            masters,
        }
    }

    pub fn master(&self, server_id: ServerId) -> &Arc<MasterService> {
        &self.masters[&server_id]
    }
}

/// Locator for a test master.
pub fn locator(server_id: ServerId) -> String {
    format!("mock:host=master{server_id}")
}

/// Directory record routing one indexlet range to `server_id`.
pub fn indexlet_record(
    server_id: ServerId,
    table_id: u64,
    index_id: u8,
    first_key: &[u8],
    first_not_owned_key: &[u8],
) -> IndexletRecord {
    IndexletRecord {
        table_id,
        index_id,
        first_key: first_key.to_vec(),
        first_not_owned_key: first_not_owned_key.to_vec(),
        server_id,
        service_locator: locator(server_id),
    }
}

/// Directory record routing one whole-table tablet to `server_id`.
pub fn full_tablet(server_id: ServerId, table_id: u64, state: TabletState) -> TabletWithLocator {
    TabletWithLocator {
        tablet: Tablet {
            table_id,
            start_key_hash: 0,
            end_key_hash: u64::MAX,
            state,
            server_id,
        },
        service_locator: locator(server_id),
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
