//! Server-side dispatch of master RPCs onto the local managers.
//!
//! This is the counterpart to `master_client`: requests arrive as raw
//! buffers from a transport, are decoded, routed to the indexlet or tablet
//! manager, and answered with an encoded response. Failures never escape
//! as errors; they are encoded as status words.

use async_trait::async_trait;
use bytes::Bytes;

use mica_rpc::transport::Service;
use mica_rpc::wire::{
    status_response, DropIndexletOwnershipRequest, IndexEntryRequest, LookupIndexKeysRequest,
    LookupIndexKeysResponse, Opcode, RequestHeader, Status, TabletOwnershipRequest,
    TakeIndexletOwnershipRequest,
};

use crate::indexlet_manager::IndexletManager;
use crate::tablet::TabletManager;

/// One master's RPC surface: the managers plus the request router.
pub struct MasterService {
    indexlets: IndexletManager,
    tablets: TabletManager,
}

impl MasterService {
    pub fn new() -> Self {
        Self {
            indexlets: IndexletManager::new(),
            tablets: TabletManager::new(),
        }
    }

    pub fn indexlets(&self) -> &IndexletManager {
        &self.indexlets
    }

    pub fn tablets(&self) -> &TabletManager {
        &self.tablets
    }

    fn dispatch(&self, mut request: Bytes) -> Result<Bytes, Status> {
        let header = RequestHeader::decode(&mut request).map_err(|err| {
            tracing::debug!(error = %err, "dropping malformed request");
            Status::InternalError
        })?;
        match header.opcode {
            Opcode::TakeIndexletOwnership => {
                let req = TakeIndexletOwnershipRequest::decode(&mut request)
                    .map_err(|_| Status::InternalError)?;
                if !self.indexlets.add_indexlet(
                    req.table_id,
                    req.index_id,
                    req.storage_table_id,
                    &req.first_key,
                    &req.first_not_owned_key,
                ) {
                    return Err(Status::InternalError);
                }
                Ok(status_response(Status::Ok))
            }
            Opcode::DropIndexletOwnership => {
                let req = DropIndexletOwnershipRequest::decode(&mut request)
                    .map_err(|_| Status::InternalError)?;
                if !self.indexlets.delete_indexlet(
                    req.table_id,
                    req.index_id,
                    &req.first_key,
                    &req.first_not_owned_key,
                ) {
                    return Err(Status::UnknownIndexlet);
                }
                Ok(status_response(Status::Ok))
            }
            Opcode::InsertIndexEntry => {
                let req =
                    IndexEntryRequest::decode(&mut request).map_err(|_| Status::InternalError)?;
                self.indexlets.insert_entry(
                    req.table_id,
                    req.index_id,
                    &req.key,
                    req.primary_key_hash,
                )?;
                Ok(status_response(Status::Ok))
            }
            Opcode::RemoveIndexEntry => {
                let req =
                    IndexEntryRequest::decode(&mut request).map_err(|_| Status::InternalError)?;
                self.indexlets.remove_entry(
                    req.table_id,
                    req.index_id,
                    &req.key,
                    req.primary_key_hash,
                )?;
                Ok(status_response(Status::Ok))
            }
            Opcode::LookupIndexKeys => {
                let req = LookupIndexKeysRequest::decode(&mut request)
                    .map_err(|_| Status::InternalError)?;
                let scan = self.indexlets.lookup_index_keys(
                    req.table_id,
                    req.index_id,
                    &req.first_key,
                    req.first_allowed_hash,
                    &req.last_key,
                    req.max_num_hashes,
                )?;
                let (next_key, next_key_hash) = match scan.next_key {
                    Some((key, hash)) => (Bytes::from(key), hash),
                    None => (Bytes::new(), 0),
                };
                Ok(LookupIndexKeysResponse {
                    status: Status::Ok,
                    hashes: scan.hashes,
                    next_key_hash,
                    next_key,
                }
                .encode())
            }
            Opcode::TakeTabletOwnership => {
                let req = TabletOwnershipRequest::decode(&mut request)
                    .map_err(|_| Status::InternalError)?;
                self.tablets.take_tablet_ownership(
                    req.table_id,
                    req.start_key_hash,
                    req.end_key_hash,
                )?;
                Ok(status_response(Status::Ok))
            }
            Opcode::DropTabletOwnership => {
                let req = TabletOwnershipRequest::decode(&mut request)
                    .map_err(|_| Status::InternalError)?;
                self.tablets.drop_tablet_ownership(
                    req.table_id,
                    req.start_key_hash,
                    req.end_key_hash,
                )?;
                Ok(status_response(Status::Ok))
            }
        }
    }
}

impl Default for MasterService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Service for MasterService {
    async fn handle_rpc(&self, request: Bytes) -> Bytes {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(status) => status_response(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use mica_rpc::wire::ResponseHeader;

    use super::*;

    fn take_indexlet(service: &MasterService) {
        assert!(service.indexlets.add_indexlet(1, 0, 10, b"\x00", b"\xff"));
    }

    #[tokio::test]
    async fn insert_then_lookup_round_trip() {
        let service = MasterService::new();
        take_indexlet(&service);

        let insert = IndexEntryRequest {
            table_id: 1,
            index_id: 0,
            primary_key_hash: 7,
            key: Bytes::from_static(b"apple"),
        }
        .encode(Opcode::InsertIndexEntry);
        let response = service.handle_rpc(insert).await;
        assert_eq!(
            ResponseHeader::decode(&response).unwrap().status,
            Status::Ok
        );

        let lookup = LookupIndexKeysRequest {
            table_id: 1,
            index_id: 0,
            first_allowed_hash: 0,
            max_num_hashes: 16,
            first_key: Bytes::from_static(b"a"),
            last_key: Bytes::from_static(b"b"),
        }
        .encode();
        let response = service.handle_rpc(lookup).await;
        let decoded = LookupIndexKeysResponse::decode(&response).unwrap();
        assert_eq!(decoded.status, Status::Ok);
        assert_eq!(decoded.hashes, vec![7]);
        assert!(decoded.next_key.is_empty());
    }

    #[tokio::test]
    async fn unknown_indexlet_surfaces_as_status() {
        let service = MasterService::new();
        let insert = IndexEntryRequest {
            table_id: 1,
            index_id: 0,
            primary_key_hash: 7,
            key: Bytes::from_static(b"apple"),
        }
        .encode(Opcode::InsertIndexEntry);
        let response = service.handle_rpc(insert).await;
        assert_eq!(
            ResponseHeader::decode(&response).unwrap().status,
            Status::UnknownIndexlet
        );
    }

    #[tokio::test]
    async fn malformed_request_is_internal_error() {
        let service = MasterService::new();
        let response = service.handle_rpc(Bytes::from_static(&[1])).await;
        assert_eq!(
            ResponseHeader::decode(&response).unwrap().status,
            Status::InternalError
        );
    }

    #[tokio::test]
    async fn tablet_ownership_round_trip() {
        let service = MasterService::new();
        let take = TabletOwnershipRequest {
            table_id: 4,
            start_key_hash: 0,
            end_key_hash: 100,
        }
        .encode(Opcode::TakeTabletOwnership);
        let response = service.handle_rpc(take).await;
        assert_eq!(
            ResponseHeader::decode(&response).unwrap().status,
            Status::Ok
        );
        assert!(service.tablets().owns(4, 50));

        let drop_unknown = TabletOwnershipRequest {
            table_id: 4,
            start_key_hash: 1,
            end_key_hash: 100,
        }
        .encode(Opcode::DropTabletOwnership);
        let response = service.handle_rpc(drop_unknown).await;
        assert_eq!(
            ResponseHeader::decode(&response).unwrap().status,
            Status::UnknownTablet
        );
    }
}
