//! Wire format shared by Mica clients and servers.
//!
//! Requests start with `{opcode: u16, service: u8}`; responses start with a
//! `u32` status word. All integer fields are little-endian and keys are
//! length-prefixed with a `u16`, so a key can be 0..=65535 bytes. Records
//! decode defensively: a short or unrecognized buffer is a typed error,
//! never a panic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the common request header.
pub const REQUEST_HEADER_LEN: usize = 3;
/// Size of the minimal (status-only) response header.
pub const RESPONSE_HEADER_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated")]
    Truncated,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("unknown service {0}")]
    UnknownService(u8),
    #[error("unknown status {0}")]
    UnknownStatus(u32),
}

/// Status word carried as the first field of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    UnknownTablet,
    UnknownIndexlet,
    Retry,
    TableDoesntExist,
    ObjectDoesntExist,
    ServerNotUp,
    InternalError,
}

impl Status {
    pub fn to_wire(self) -> u32 {
        match self {
            Status::Ok => 0,
            Status::UnknownTablet => 1,
            Status::UnknownIndexlet => 2,
            Status::Retry => 3,
            Status::TableDoesntExist => 4,
            Status::ObjectDoesntExist => 5,
            Status::ServerNotUp => 6,
            Status::InternalError => 7,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self, WireError> {
        Ok(match raw {
            0 => Status::Ok,
            1 => Status::UnknownTablet,
            2 => Status::UnknownIndexlet,
            3 => Status::Retry,
            4 => Status::TableDoesntExist,
            5 => Status::ObjectDoesntExist,
            6 => Status::ServerNotUp,
            7 => Status::InternalError,
            other => return Err(WireError::UnknownStatus(other)),
        })
    }
}

/// Service classes a request can address on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Master,
    Backup,
    Coordinator,
}

/// Sentinel bounding the service enumeration on the wire.
pub const INVALID_SERVICE: u8 = 3;

impl ServiceType {
    pub fn to_wire(self) -> u8 {
        match self {
            ServiceType::Master => 0,
            ServiceType::Backup => 1,
            ServiceType::Coordinator => 2,
        }
    }

    pub fn from_wire(raw: u8) -> Result<Self, WireError> {
        Ok(match raw {
            0 => ServiceType::Master,
            1 => ServiceType::Backup,
            2 => ServiceType::Coordinator,
            other => return Err(WireError::UnknownService(other)),
        })
    }
}

/// Operations a master service accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    TakeIndexletOwnership,
    DropIndexletOwnership,
    InsertIndexEntry,
    RemoveIndexEntry,
    LookupIndexKeys,
    TakeTabletOwnership,
    DropTabletOwnership,
}

impl Opcode {
    pub fn to_wire(self) -> u16 {
        match self {
            Opcode::TakeIndexletOwnership => 1,
            Opcode::DropIndexletOwnership => 2,
            Opcode::InsertIndexEntry => 3,
            Opcode::RemoveIndexEntry => 4,
            Opcode::LookupIndexKeys => 5,
            Opcode::TakeTabletOwnership => 6,
            Opcode::DropTabletOwnership => 7,
        }
    }

    pub fn from_wire(raw: u16) -> Result<Self, WireError> {
        Ok(match raw {
            1 => Opcode::TakeIndexletOwnership,
            2 => Opcode::DropIndexletOwnership,
            3 => Opcode::InsertIndexEntry,
            4 => Opcode::RemoveIndexEntry,
            5 => Opcode::LookupIndexKeys,
            6 => Opcode::TakeTabletOwnership,
            7 => Opcode::DropTabletOwnership,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

fn need(buf: &Bytes, len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, WireError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, WireError> {
    need(buf, len)?;
    Ok(buf.split_to(len))
}

/// Common prefix of every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode: Opcode,
    pub service: ServiceType,
}

impl RequestHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.opcode.to_wire());
        buf.put_u8(self.service.to_wire());
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let opcode = Opcode::from_wire(get_u16(buf)?)?;
        let service = ServiceType::from_wire(get_u8(buf)?)?;
        Ok(Self { opcode, service })
    }
}

/// Common prefix of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub status: Status,
}

impl ResponseHeader {
    pub fn decode(response: &Bytes) -> Result<Self, WireError> {
        let mut buf = response.clone();
        let status = Status::from_wire(get_u32(&mut buf)?)?;
        Ok(Self { status })
    }
}

/// Build a response that carries nothing but a status word.
pub fn status_response(status: Status) -> Bytes {
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN);
    buf.put_u32_le(status.to_wire());
    buf.freeze()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeIndexletOwnershipRequest {
    pub table_id: u64,
    pub index_id: u8,
    pub storage_table_id: u64,
    pub first_key: Bytes,
    pub first_not_owned_key: Bytes,
}

impl TakeIndexletOwnershipRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        RequestHeader {
            opcode: Opcode::TakeIndexletOwnership,
            service: ServiceType::Master,
        }
        .encode(&mut buf);
        buf.put_u64_le(self.table_id);
        buf.put_u8(self.index_id);
        buf.put_u64_le(self.storage_table_id);
        buf.put_u16_le(self.first_key.len() as u16);
        buf.put_u16_le(self.first_not_owned_key.len() as u16);
        buf.extend_from_slice(&self.first_key);
        buf.extend_from_slice(&self.first_not_owned_key);
        buf.freeze()
    }

    /// Decode the body that follows the request header.
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let table_id = get_u64(buf)?;
        let index_id = get_u8(buf)?;
        let storage_table_id = get_u64(buf)?;
        let first_key_len = get_u16(buf)? as usize;
        let first_not_owned_len = get_u16(buf)? as usize;
        let first_key = get_bytes(buf, first_key_len)?;
        let first_not_owned_key = get_bytes(buf, first_not_owned_len)?;
        Ok(Self {
            table_id,
            index_id,
            storage_table_id,
            first_key,
            first_not_owned_key,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropIndexletOwnershipRequest {
    pub table_id: u64,
    pub index_id: u8,
    pub first_key: Bytes,
    pub first_not_owned_key: Bytes,
}

impl DropIndexletOwnershipRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        RequestHeader {
            opcode: Opcode::DropIndexletOwnership,
            service: ServiceType::Master,
        }
        .encode(&mut buf);
        buf.put_u64_le(self.table_id);
        buf.put_u8(self.index_id);
        buf.put_u16_le(self.first_key.len() as u16);
        buf.put_u16_le(self.first_not_owned_key.len() as u16);
        buf.extend_from_slice(&self.first_key);
        buf.extend_from_slice(&self.first_not_owned_key);
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let table_id = get_u64(buf)?;
        let index_id = get_u8(buf)?;
        let first_key_len = get_u16(buf)? as usize;
        let first_not_owned_len = get_u16(buf)? as usize;
        let first_key = get_bytes(buf, first_key_len)?;
        let first_not_owned_key = get_bytes(buf, first_not_owned_len)?;
        Ok(Self {
            table_id,
            index_id,
            first_key,
            first_not_owned_key,
        })
    }
}

/// Shared body of `InsertIndexEntry` and `RemoveIndexEntry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntryRequest {
    pub table_id: u64,
    pub index_id: u8,
    pub primary_key_hash: u64,
    pub key: Bytes,
}

impl IndexEntryRequest {
    pub fn encode(&self, opcode: Opcode) -> Bytes {
        let mut buf = BytesMut::new();
        RequestHeader {
            opcode,
            service: ServiceType::Master,
        }
        .encode(&mut buf);
        buf.put_u64_le(self.table_id);
        buf.put_u8(self.index_id);
        buf.put_u64_le(self.primary_key_hash);
        buf.put_u16_le(self.key.len() as u16);
        buf.extend_from_slice(&self.key);
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let table_id = get_u64(buf)?;
        let index_id = get_u8(buf)?;
        let primary_key_hash = get_u64(buf)?;
        let key_len = get_u16(buf)? as usize;
        let key = get_bytes(buf, key_len)?;
        Ok(Self {
            table_id,
            index_id,
            primary_key_hash,
            key,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupIndexKeysRequest {
    pub table_id: u64,
    pub index_id: u8,
    pub first_allowed_hash: u64,
    pub max_num_hashes: u32,
    pub first_key: Bytes,
    pub last_key: Bytes,
}

impl LookupIndexKeysRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        RequestHeader {
            opcode: Opcode::LookupIndexKeys,
            service: ServiceType::Master,
        }
        .encode(&mut buf);
        buf.put_u64_le(self.table_id);
        buf.put_u8(self.index_id);
        buf.put_u64_le(self.first_allowed_hash);
        buf.put_u32_le(self.max_num_hashes);
        buf.put_u16_le(self.first_key.len() as u16);
        buf.put_u16_le(self.last_key.len() as u16);
        buf.extend_from_slice(&self.first_key);
        buf.extend_from_slice(&self.last_key);
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let table_id = get_u64(buf)?;
        let index_id = get_u8(buf)?;
        let first_allowed_hash = get_u64(buf)?;
        let max_num_hashes = get_u32(buf)?;
        let first_key_len = get_u16(buf)? as usize;
        let last_key_len = get_u16(buf)? as usize;
        let first_key = get_bytes(buf, first_key_len)?;
        let last_key = get_bytes(buf, last_key_len)?;
        Ok(Self {
            table_id,
            index_id,
            first_allowed_hash,
            max_num_hashes,
            first_key,
            last_key,
        })
    }
}

/// Fixed-size prefix of a `LookupIndexKeys` response.
pub const LOOKUP_RESPONSE_HEADER_LEN: usize = 4 + 4 + 8 + 2;

/// Response to `LookupIndexKeys`. `next_key_len == 0` on the wire means the
/// scan is complete; otherwise the caller resumes at
/// `(next_key, next_key_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupIndexKeysResponse {
    pub status: Status,
    pub hashes: Vec<u64>,
    pub next_key_hash: u64,
    pub next_key: Bytes,
}

impl LookupIndexKeysResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            LOOKUP_RESPONSE_HEADER_LEN + self.hashes.len() * 8 + self.next_key.len(),
        );
        buf.put_u32_le(self.status.to_wire());
        buf.put_u32_le(self.hashes.len() as u32);
        buf.put_u64_le(self.next_key_hash);
        buf.put_u16_le(self.next_key.len() as u16);
        for hash in &self.hashes {
            buf.put_u64_le(*hash);
        }
        buf.extend_from_slice(&self.next_key);
        buf.freeze()
    }

    pub fn decode(response: &Bytes) -> Result<Self, WireError> {
        let mut buf = response.clone();
        let status = Status::from_wire(get_u32(&mut buf)?)?;
        let num_hashes = get_u32(&mut buf)? as usize;
        let next_key_hash = get_u64(&mut buf)?;
        let next_key_len = get_u16(&mut buf)? as usize;
        let mut hashes = Vec::with_capacity(num_hashes.min(1024));
        for _ in 0..num_hashes {
            hashes.push(get_u64(&mut buf)?);
        }
        let next_key = get_bytes(&mut buf, next_key_len)?;
        Ok(Self {
            status,
            hashes,
            next_key_hash,
            next_key,
        })
    }
}

/// Shared body of `TakeTabletOwnership` and `DropTabletOwnership`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletOwnershipRequest {
    pub table_id: u64,
    pub start_key_hash: u64,
    pub end_key_hash: u64,
}

impl TabletOwnershipRequest {
    pub fn encode(&self, opcode: Opcode) -> Bytes {
        let mut buf = BytesMut::new();
        RequestHeader {
            opcode,
            service: ServiceType::Master,
        }
        .encode(&mut buf);
        buf.put_u64_le(self.table_id);
        buf.put_u64_le(self.start_key_hash);
        buf.put_u64_le(self.end_key_hash);
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        let table_id = get_u64(buf)?;
        let start_key_hash = get_u64(buf)?;
        let end_key_hash = get_u64(buf)?;
        Ok(Self {
            table_id,
            start_key_hash,
            end_key_hash,
        })
    }
}
