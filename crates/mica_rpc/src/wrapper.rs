//! The retryable state machine every outgoing RPC runs through.
//!
//! A request moves `NotStarted -> InProgress -> (Finished | Retry |
//! Canceled | Failed)`. Instead of an inheritance tree, the machine is
//! parameterized by a single strategy object, `RpcTarget`, which resolves
//! the destination session and classifies response statuses and transport
//! failures. Per-operation types are plain record builders around this
//! machine.
//!
//! Each attempt resolves the target anew, so a strategy that repairs its
//! routing state (flushing a stale cache entry, say) before returning
//! `Retry` converges once the directory does.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::transport::{SessionRef, TransportError};
use crate::wire::{ResponseHeader, Status, WireError, RESPONSE_HEADER_LEN};
use crate::RpcConfig;

/// Lifecycle of one RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    NotStarted,
    InProgress,
    Finished,
    Retry,
    Canceled,
    Failed,
}

impl RpcState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RpcState::Finished | RpcState::Canceled | RpcState::Failed)
    }
}

/// What the target strategy decided after inspecting a response status or
/// a transport failure. Anything but `Retry` ends the RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Done,
    Retry,
    Fatal(Status),
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("rpc canceled")]
    Canceled,
    #[error("server not up")]
    ServerNotUp,
    #[error("table does not exist")]
    TableDoesntExist,
    #[error("object does not exist")]
    ObjectDoesntExist,
    #[error("remote rejected request: {0:?}")]
    Remote(Status),
    #[error("deadline expired")]
    TimedOut,
    #[error("malformed response: {0}")]
    BadResponse(#[from] WireError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl RpcError {
    /// Map a terminal wire status onto the typed error surface.
    pub fn from_status(status: Status) -> RpcError {
        match status {
            Status::ServerNotUp => RpcError::ServerNotUp,
            Status::TableDoesntExist => RpcError::TableDoesntExist,
            Status::ObjectDoesntExist => RpcError::ObjectDoesntExist,
            other => RpcError::Remote(other),
        }
    }
}

/// Strategy object driving one RPC: where it goes and how its outcomes are
/// classified.
#[async_trait]
pub trait RpcTarget: Send {
    /// Resolve the session the next attempt should use. `Ok(None)` cancels
    /// the RPC without transmission (the target does not exist).
    async fn resolve(&mut self) -> Result<Option<SessionRef>, RpcError>;

    /// Classify a response status word. A `Retry` return must already have
    /// repaired whatever routing state made the attempt fail.
    async fn on_status(&mut self, status: Status) -> StatusAction;

    /// React to a transport-level failure on `session`.
    async fn on_transport_error(
        &mut self,
        session: &SessionRef,
        error: &TransportError,
    ) -> StatusAction;
}

/// One outgoing RPC: a request buffer plus the state machine that carries
/// it to a terminal state.
pub struct RpcWrapper<T> {
    target: T,
    request: Bytes,
    response_header_len: usize,
    state: RpcState,
    attempts: u64,
    response: Bytes,
    failure: Option<RpcError>,
}

impl<T: RpcTarget> RpcWrapper<T> {
    /// `response_header_len` is the minimum length `wait` accepts for a
    /// finished response; it is at least the status word.
    pub fn new(target: T, request: Bytes, response_header_len: usize) -> Self {
        Self {
            target,
            request,
            response_header_len: response_header_len.max(RESPONSE_HEADER_LEN),
            state: RpcState::NotStarted,
            attempts: 0,
            response: Bytes::new(),
            failure: None,
        }
    }

    pub fn state(&self) -> RpcState {
        self.state
    }

    /// Number of transmissions so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// The finished response buffer. Empty until the state is `Finished`.
    pub fn response(&self) -> &Bytes {
        &self.response
    }

    /// Abandon the RPC before (or instead of) waiting on it.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = RpcState::Canceled;
        }
    }

    fn fail(&mut self, err: RpcError) -> RpcError {
        self.state = RpcState::Failed;
        self.failure = Some(err.clone());
        err
    }

    /// Drive the RPC to a terminal state and return the response buffer.
    ///
    /// Exactly one terminal state is reached per RPC; further calls after
    /// that replay the terminal outcome.
    pub async fn wait(&mut self) -> Result<Bytes, RpcError> {
        match self.state {
            RpcState::Finished => return Ok(self.response.clone()),
            RpcState::Canceled => return Err(RpcError::Canceled),
            RpcState::Failed => {
                return Err(self.failure.clone().unwrap_or(RpcError::Canceled));
            }
            _ => {}
        }
        loop {
            let session = match self.target.resolve().await {
                Ok(Some(session)) => session,
                Ok(None) => {
                    self.state = RpcState::Canceled;
                    return Err(RpcError::Canceled);
                }
                Err(err) => {
                    return Err(self.fail(err));
                }
            };
            self.state = RpcState::InProgress;
            self.attempts += 1;
            match session.send_request(self.request.clone()).await {
                Ok(response) => {
                    let header = match ResponseHeader::decode(&response) {
                        Ok(header) => header,
                        Err(err) => {
                            return Err(self.fail(RpcError::BadResponse(err)));
                        }
                    };
                    match self.target.on_status(header.status).await {
                        StatusAction::Done => {
                            if response.len() < self.response_header_len {
                                return Err(self.fail(RpcError::BadResponse(WireError::Truncated)));
                            }
                            self.response = response;
                            self.state = RpcState::Finished;
                            return Ok(self.response.clone());
                        }
                        StatusAction::Retry => {
                            self.state = RpcState::Retry;
                        }
                        StatusAction::Fatal(status) => {
                            return Err(self.fail(RpcError::from_status(status)));
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        locator = session.service_locator(),
                        error = %err,
                        "transport failure on rpc"
                    );
                    match self.target.on_transport_error(&session, &err).await {
                        StatusAction::Retry => {
                            self.state = RpcState::Retry;
                        }
                        StatusAction::Fatal(status) => {
                            return Err(self.fail(RpcError::from_status(status)));
                        }
                        StatusAction::Done => {
                            return Err(self.fail(RpcError::Transport(err)));
                        }
                    }
                }
            }
        }
    }
}

/// Exponential backoff with jitter for retryable failures.
pub fn backoff_delay(config: &RpcConfig, failures: u32) -> Duration {
    let shift = failures.min(config.backoff_max_shift);
    let scaled = config
        .backoff_base
        .saturating_mul(1u32 << shift)
        .min(config.backoff_max);
    let jitter_ms = scaled.as_millis().max(1) as u64 / 2 + 1;
    scaled + Duration::from_millis(rand::random::<u64>() % jitter_ms)
}
