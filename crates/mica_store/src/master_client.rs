//! Client-side operations against Mica masters.
//!
//! Every operation is a thin record builder around the `RpcWrapper` state
//! machine: index-routed operations resolve their target through the
//! `ObjectFinder` and self-correct on stale routing, while ownership
//! operations are addressed by server id and consult the server list when
//! the transport fails. Each RPC type exposes an async `wait` that drives
//! the request to a terminal state.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use mica_rpc::cluster::{ServerId, ServerState};
use mica_rpc::transport::{SessionRef, TransportError};
use mica_rpc::wire::{
    DropIndexletOwnershipRequest, IndexEntryRequest, LookupIndexKeysRequest,
    LookupIndexKeysResponse, Opcode, Status, TabletOwnershipRequest,
    TakeIndexletOwnershipRequest, LOOKUP_RESPONSE_HEADER_LEN, RESPONSE_HEADER_LEN,
};
use mica_rpc::wrapper::{backoff_delay, RpcError, RpcTarget, RpcWrapper, StatusAction};
use mica_rpc::Context;

use crate::indexlet_manager::IndexKeyScan;
use crate::object_finder::ObjectFinder;

/// Target strategy for index-routed RPCs: resolve by `(table, index, key)`
/// and recover from stale routing by flushing the config cache.
struct IndexTarget {
    finder: Arc<ObjectFinder>,
    table_id: u64,
    index_id: u8,
    key: Bytes,
}

#[async_trait]
impl RpcTarget for IndexTarget {
    async fn resolve(&mut self) -> Result<Option<SessionRef>, RpcError> {
        self.finder
            .lookup_index(self.table_id, self.index_id, &self.key)
            .await
    }

    async fn on_status(&mut self, status: Status) -> StatusAction {
        match status {
            Status::Ok => StatusAction::Done,
            Status::UnknownIndexlet => {
                // The entry is not where we thought: refresh and re-send.
                tracing::info!(
                    table_id = self.table_id,
                    index_id = self.index_id,
                    "server does not own this index key; refreshing config cache"
                );
                self.finder.flush(self.table_id).await;
                StatusAction::Retry
            }
            other => StatusAction::Fatal(other),
        }
    }

    async fn on_transport_error(
        &mut self,
        _session: &SessionRef,
        _error: &TransportError,
    ) -> StatusAction {
        // Drop the stale session and route, then rebuild both on re-send.
        self.finder
            .flush_index_session(self.table_id, self.index_id, &self.key)
            .await;
        self.finder.flush(self.table_id).await;
        StatusAction::Retry
    }
}

/// Target strategy for RPCs addressed to one specific server.
struct ServerIdTarget {
    context: Arc<Context>,
    server_id: ServerId,
    failures: u32,
}

impl ServerIdTarget {
    fn new(context: Arc<Context>, server_id: ServerId) -> Self {
        Self {
            context,
            server_id,
            failures: 0,
        }
    }

    async fn back_off(&mut self) {
        let delay = backoff_delay(&self.context.rpc_config, self.failures);
        self.failures += 1;
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl RpcTarget for ServerIdTarget {
    async fn resolve(&mut self) -> Result<Option<SessionRef>, RpcError> {
        let Some(details) = self.context.server_list.details(self.server_id) else {
            return Err(RpcError::ServerNotUp);
        };
        if details.state != ServerState::Up {
            return Err(RpcError::ServerNotUp);
        }
        Ok(Some(
            self.context
                .transport_manager
                .get_session(&details.service_locator)?,
        ))
    }

    async fn on_status(&mut self, status: Status) -> StatusAction {
        match status {
            Status::Ok => StatusAction::Done,
            Status::Retry => {
                self.back_off().await;
                StatusAction::Retry
            }
            other => StatusAction::Fatal(other),
        }
    }

    async fn on_transport_error(
        &mut self,
        session: &SessionRef,
        _error: &TransportError,
    ) -> StatusAction {
        self.context
            .transport_manager
            .flush_session(session.service_locator());
        if !self.context.server_list.is_up(self.server_id) {
            return StatusAction::Fatal(Status::ServerNotUp);
        }
        self.back_off().await;
        StatusAction::Retry
    }
}

/// Map a canceled index RPC onto a plain boolean: `false` means the index
/// does not exist and the operation was a silent no-op.
async fn wait_for_index_rpc(wrapper: &mut RpcWrapper<IndexTarget>) -> Result<bool, RpcError> {
    match wrapper.wait().await {
        Ok(_) => Ok(true),
        Err(RpcError::Canceled) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Asynchronous `InsertIndexEntry` request.
pub struct InsertIndexEntryRpc {
    wrapper: RpcWrapper<IndexTarget>,
}

impl InsertIndexEntryRpc {
    pub fn new(
        finder: &Arc<ObjectFinder>,
        table_id: u64,
        index_id: u8,
        key: &[u8],
        primary_key_hash: u64,
    ) -> Self {
        let request = IndexEntryRequest {
            table_id,
            index_id,
            primary_key_hash,
            key: Bytes::copy_from_slice(key),
        }
        .encode(Opcode::InsertIndexEntry);
        Self {
            wrapper: RpcWrapper::new(
                IndexTarget {
                    finder: finder.clone(),
                    table_id,
                    index_id,
                    key: Bytes::copy_from_slice(key),
                },
                request,
                RESPONSE_HEADER_LEN,
            ),
        }
    }

    /// Complete the RPC; `false` means the index does not exist.
    pub async fn wait(&mut self) -> Result<bool, RpcError> {
        wait_for_index_rpc(&mut self.wrapper).await
    }
}

/// Asynchronous `RemoveIndexEntry` request.
pub struct RemoveIndexEntryRpc {
    wrapper: RpcWrapper<IndexTarget>,
}

impl RemoveIndexEntryRpc {
    pub fn new(
        finder: &Arc<ObjectFinder>,
        table_id: u64,
        index_id: u8,
        key: &[u8],
        primary_key_hash: u64,
    ) -> Self {
        let request = IndexEntryRequest {
            table_id,
            index_id,
            primary_key_hash,
            key: Bytes::copy_from_slice(key),
        }
        .encode(Opcode::RemoveIndexEntry);
        Self {
            wrapper: RpcWrapper::new(
                IndexTarget {
                    finder: finder.clone(),
                    table_id,
                    index_id,
                    key: Bytes::copy_from_slice(key),
                },
                request,
                RESPONSE_HEADER_LEN,
            ),
        }
    }

    /// Complete the RPC; `false` means the index does not exist.
    pub async fn wait(&mut self) -> Result<bool, RpcError> {
        wait_for_index_rpc(&mut self.wrapper).await
    }
}

/// Asynchronous `LookupIndexKeys` request for one scan page.
pub struct LookupIndexKeysRpc {
    wrapper: RpcWrapper<IndexTarget>,
}

impl LookupIndexKeysRpc {
    pub fn new(
        finder: &Arc<ObjectFinder>,
        table_id: u64,
        index_id: u8,
        first_key: &[u8],
        first_allowed_hash: u64,
        last_key: &[u8],
        max_num_hashes: u32,
    ) -> Self {
        let request = LookupIndexKeysRequest {
            table_id,
            index_id,
            first_allowed_hash,
            max_num_hashes,
            first_key: Bytes::copy_from_slice(first_key),
            last_key: Bytes::copy_from_slice(last_key),
        }
        .encode();
        Self {
            wrapper: RpcWrapper::new(
                IndexTarget {
                    finder: finder.clone(),
                    table_id,
                    index_id,
                    key: Bytes::copy_from_slice(first_key),
                },
                request,
                LOOKUP_RESPONSE_HEADER_LEN,
            ),
        }
    }

    /// Complete the RPC; `None` means the index does not exist.
    pub async fn wait(&mut self) -> Result<Option<IndexKeyScan>, RpcError> {
        let response = match self.wrapper.wait().await {
            Ok(response) => response,
            Err(RpcError::Canceled) => return Ok(None),
            Err(err) => return Err(err),
        };
        let decoded = LookupIndexKeysResponse::decode(&response)?;
        let next_key = if decoded.next_key.is_empty() {
            None
        } else {
            Some((decoded.next_key.to_vec(), decoded.next_key_hash))
        };
        Ok(Some(IndexKeyScan {
            hashes: decoded.hashes,
            next_key,
        }))
    }
}

/// Asynchronous `TakeIndexletOwnership` request to a specific master.
pub struct TakeIndexletOwnershipRpc {
    wrapper: RpcWrapper<ServerIdTarget>,
}

impl TakeIndexletOwnershipRpc {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: &Arc<Context>,
        server_id: ServerId,
        table_id: u64,
        index_id: u8,
        storage_table_id: u64,
        first_key: &[u8],
        first_not_owned_key: &[u8],
    ) -> Self {
        let request = TakeIndexletOwnershipRequest {
            table_id,
            index_id,
            storage_table_id,
            first_key: Bytes::copy_from_slice(first_key),
            first_not_owned_key: Bytes::copy_from_slice(first_not_owned_key),
        }
        .encode();
        Self {
            wrapper: RpcWrapper::new(
                ServerIdTarget::new(context.clone(), server_id),
                request,
                RESPONSE_HEADER_LEN,
            ),
        }
    }

    pub async fn wait(&mut self) -> Result<(), RpcError> {
        self.wrapper.wait().await.map(|_| ())
    }
}

/// Asynchronous `DropIndexletOwnership` request to a specific master.
pub struct DropIndexletOwnershipRpc {
    wrapper: RpcWrapper<ServerIdTarget>,
}

impl DropIndexletOwnershipRpc {
    pub fn new(
        context: &Arc<Context>,
        server_id: ServerId,
        table_id: u64,
        index_id: u8,
        first_key: &[u8],
        first_not_owned_key: &[u8],
    ) -> Self {
        let request = DropIndexletOwnershipRequest {
            table_id,
            index_id,
            first_key: Bytes::copy_from_slice(first_key),
            first_not_owned_key: Bytes::copy_from_slice(first_not_owned_key),
        }
        .encode();
        Self {
            wrapper: RpcWrapper::new(
                ServerIdTarget::new(context.clone(), server_id),
                request,
                RESPONSE_HEADER_LEN,
            ),
        }
    }

    pub async fn wait(&mut self) -> Result<(), RpcError> {
        self.wrapper.wait().await.map(|_| ())
    }
}

/// Asynchronous `TakeTabletOwnership` request to a specific master.
pub struct TakeTabletOwnershipRpc {
    wrapper: RpcWrapper<ServerIdTarget>,
}

impl TakeTabletOwnershipRpc {
    pub fn new(
        context: &Arc<Context>,
        server_id: ServerId,
        table_id: u64,
        start_key_hash: u64,
        end_key_hash: u64,
    ) -> Self {
        let request = TabletOwnershipRequest {
            table_id,
            start_key_hash,
            end_key_hash,
        }
        .encode(Opcode::TakeTabletOwnership);
        Self {
            wrapper: RpcWrapper::new(
                ServerIdTarget::new(context.clone(), server_id),
                request,
                RESPONSE_HEADER_LEN,
            ),
        }
    }

    pub async fn wait(&mut self) -> Result<(), RpcError> {
        self.wrapper.wait().await.map(|_| ())
    }
}

/// Asynchronous `DropTabletOwnership` request to a specific master.
pub struct DropTabletOwnershipRpc {
    wrapper: RpcWrapper<ServerIdTarget>,
}

impl DropTabletOwnershipRpc {
    pub fn new(
        context: &Arc<Context>,
        server_id: ServerId,
        table_id: u64,
        start_key_hash: u64,
        end_key_hash: u64,
    ) -> Self {
        let request = TabletOwnershipRequest {
            table_id,
            start_key_hash,
            end_key_hash,
        }
        .encode(Opcode::DropTabletOwnership);
        Self {
            wrapper: RpcWrapper::new(
                ServerIdTarget::new(context.clone(), server_id),
                request,
                RESPONSE_HEADER_LEN,
            ),
        }
    }

    pub async fn wait(&mut self) -> Result<(), RpcError> {
        self.wrapper.wait().await.map(|_| ())
    }
}

/// Insert an index entry; `false` means the index does not exist.
pub async fn insert_index_entry(
    finder: &Arc<ObjectFinder>,
    table_id: u64,
    index_id: u8,
    key: &[u8],
    primary_key_hash: u64,
) -> Result<bool, RpcError> {
    InsertIndexEntryRpc::new(finder, table_id, index_id, key, primary_key_hash)
        .wait()
        .await
}

/// Remove an index entry; `false` means the index does not exist.
pub async fn remove_index_entry(
    finder: &Arc<ObjectFinder>,
    table_id: u64,
    index_id: u8,
    key: &[u8],
    primary_key_hash: u64,
) -> Result<bool, RpcError> {
    RemoveIndexEntryRpc::new(finder, table_id, index_id, key, primary_key_hash)
        .wait()
        .await
}

/// Fetch one page of primary key hashes for `[first_key, last_key]`;
/// `None` means the index does not exist.
pub async fn lookup_index_keys(
    finder: &Arc<ObjectFinder>,
    table_id: u64,
    index_id: u8,
    first_key: &[u8],
    first_allowed_hash: u64,
    last_key: &[u8],
    max_num_hashes: u32,
) -> Result<Option<IndexKeyScan>, RpcError> {
    LookupIndexKeysRpc::new(
        finder,
        table_id,
        index_id,
        first_key,
        first_allowed_hash,
        last_key,
        max_num_hashes,
    )
    .wait()
    .await
}

/// Scan an entire closed key range, following continuations across pages
/// and indexlet boundaries, and return every hash in scan order.
pub async fn scan_index_keys(
    finder: &Arc<ObjectFinder>,
    table_id: u64,
    index_id: u8,
    first_key: &[u8],
    last_key: &[u8],
    page_size: u32,
) -> Result<Vec<u64>, RpcError> {
    let mut hashes = Vec::new();
    let mut resume_key = first_key.to_vec();
    let mut resume_hash = 0u64;
    loop {
        let Some(page) = lookup_index_keys(
            finder,
            table_id,
            index_id,
            &resume_key,
            resume_hash,
            last_key,
            page_size,
        )
        .await?
        else {
            return Ok(hashes);
        };
        hashes.extend(page.hashes);
        match page.next_key {
            None => return Ok(hashes),
            Some((key, hash)) => {
                resume_key = key;
                resume_hash = hash;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub async fn take_indexlet_ownership(
    context: &Arc<Context>,
    server_id: ServerId,
    table_id: u64,
    index_id: u8,
    storage_table_id: u64,
    first_key: &[u8],
    first_not_owned_key: &[u8],
) -> Result<(), RpcError> {
    TakeIndexletOwnershipRpc::new(
        context,
        server_id,
        table_id,
        index_id,
        storage_table_id,
        first_key,
        first_not_owned_key,
    )
    .wait()
    .await
}

pub async fn drop_indexlet_ownership(
    context: &Arc<Context>,
    server_id: ServerId,
    table_id: u64,
    index_id: u8,
    first_key: &[u8],
    first_not_owned_key: &[u8],
) -> Result<(), RpcError> {
    DropIndexletOwnershipRpc::new(
        context,
        server_id,
        table_id,
        index_id,
        first_key,
        first_not_owned_key,
    )
    .wait()
    .await
}

pub async fn take_tablet_ownership(
    context: &Arc<Context>,
    server_id: ServerId,
    table_id: u64,
    start_key_hash: u64,
    end_key_hash: u64,
) -> Result<(), RpcError> {
    TakeTabletOwnershipRpc::new(context, server_id, table_id, start_key_hash, end_key_hash)
        .wait()
        .await
}

pub async fn drop_tablet_ownership(
    context: &Arc<Context>,
    server_id: ServerId,
    table_id: u64,
    start_key_hash: u64,
    end_key_hash: u64,
) -> Result<(), RpcError> {
    DropTabletOwnershipRpc::new(context, server_id, table_id, start_key_hash, end_key_hash)
        .wait()
        .await
}
