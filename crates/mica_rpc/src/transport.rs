//! Session-oriented transport abstraction.
//!
//! A `Session` is a reference-counted handle to a live connection to one
//! server; the same session can back many concurrent RPCs. Directories and
//! caches store service-locator strings and resolve them to sessions
//! through the `TransportManager`, which keeps at most one cached session
//! per locator. Sessions can die at any time; death is observed as an `Err`
//! from `send_request`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no transport registered for locator {0:?}")]
    NoTransport(String),
    #[error("unknown host {0:?}")]
    UnknownHost(String),
    #[error("service not available at {0:?}")]
    ServiceNotAvailable(String),
    #[error("session to {0:?} failed: {1}")]
    SessionFailed(String, String),
}

/// Reference-counted handle to a connection to one server.
pub type SessionRef = Arc<dyn Session>;

/// One live connection. `send_request` resolves to exactly one of
/// completed (`Ok`) or failed (`Err`) per call; callers must not assume
/// FIFO completion across concurrent sends on the same session.
#[async_trait]
pub trait Session: Send + Sync {
    /// Locator this session was opened against.
    fn service_locator(&self) -> &str;

    /// Send one request and wait for its response.
    async fn send_request(&self, request: Bytes) -> Result<Bytes, TransportError>;
}

impl std::fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("service_locator", &self.service_locator())
            .finish()
    }
}

/// Factory for sessions addressed by service-locator string.
pub trait Transport: Send + Sync {
    fn open_session(&self, locator: &str) -> Result<SessionRef, TransportError>;
}

/// Server-side request handler bound to a locator by a transport.
///
/// Handlers encode failures as status words in the response; the transport
/// layer never interprets response contents.
#[async_trait]
pub trait Service: Send + Sync {
    async fn handle_rpc(&self, request: Bytes) -> Bytes;
}

/// Resolves locator strings to sessions, caching one session per locator.
///
/// Transports register under a locator prefix (e.g. `"mock:"`); the first
/// registered prefix that matches a locator wins.
pub struct TransportManager {
    transports: RwLock<Vec<(String, Arc<dyn Transport>)>>,
    sessions: Mutex<HashMap<String, SessionRef>>,
}

impl TransportManager {
    pub fn new() -> Self {
        Self {
            transports: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, prefix: &str, transport: Arc<dyn Transport>) {
        self.transports
            .write()
            .unwrap()
            .push((prefix.to_string(), transport));
    }

    /// Return the cached session for `locator`, opening one on first use.
    pub fn get_session(&self, locator: &str) -> Result<SessionRef, TransportError> {
        if let Some(session) = self.sessions.lock().unwrap().get(locator) {
            return Ok(session.clone());
        }
        let transport = {
            let transports = self.transports.read().unwrap();
            transports
                .iter()
                .find(|(prefix, _)| locator.starts_with(prefix.as_str()))
                .map(|(_, transport)| transport.clone())
                .ok_or_else(|| TransportError::NoTransport(locator.to_string()))?
        };
        let session = transport.open_session(locator)?;
        self.sessions
            .lock()
            .unwrap()
            .insert(locator.to_string(), session.clone());
        Ok(session)
    }

    /// Drop the cached session for `locator`, forcing the next
    /// `get_session` to open a fresh one.
    pub fn flush_session(&self, locator: &str) {
        self.sessions.lock().unwrap().remove(locator);
    }
}

impl Default for TransportManager {
    fn default() -> Self {
        Self::new()
    }
}
