//! In-process transport that binds locators directly to services.
//!
//! Requests are injected straight into a registered `Service` with no
//! network or remote counterpart, which lets tests and single-process
//! clusters exercise the full client path. The transport can inject
//! failures on demand: an abort counter that kills the Nth upcoming send,
//! and a one-shot error for the next send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::transport::{Service, Session, SessionRef, Transport, TransportError};
use crate::wire::{RequestHeader, ServiceType};

/// Services hosted at one locator, one slot per service type.
type ServiceArray = HashMap<u8, Arc<dyn Service>>;

struct BindInner {
    services: RwLock<HashMap<String, ServiceArray>>,
    /// Countdown; the send that decrements this to zero fails.
    abort_counter: Mutex<u32>,
    /// One-shot failure message for the next send.
    fail_next: Mutex<Option<String>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Transport whose sessions dispatch to in-process services.
#[derive(Clone)]
pub struct BindTransport {
    inner: Arc<BindInner>,
}

impl BindTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BindInner {
                services: RwLock::new(HashMap::new()),
                abort_counter: Mutex::new(0),
                fail_next: Mutex::new(None),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Host `service` at `locator` for `service_type`.
    pub fn add_service(
        &self,
        locator: &str,
        service_type: ServiceType,
        service: Arc<dyn Service>,
    ) {
        self.inner
            .services
            .write()
            .unwrap()
            .entry(locator.to_string())
            .or_default()
            .insert(service_type.to_wire(), service);
    }

    /// Make the `n`th upcoming send fail as if the server never responded.
    pub fn set_abort_counter(&self, n: u32) {
        *self.inner.abort_counter.lock().unwrap() = n;
    }

    /// Make the next send fail once with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.inner.fail_next.lock().unwrap() = Some(message.to_string());
    }

    /// Requests delivered to a service and answered.
    pub fn completed_count(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Sends that reported a transport failure.
    pub fn failed_count(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }
}

impl Default for BindTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for BindTransport {
    fn open_session(&self, locator: &str) -> Result<SessionRef, TransportError> {
        if !self.inner.services.read().unwrap().contains_key(locator) {
            return Err(TransportError::UnknownHost(locator.to_string()));
        }
        Ok(Arc::new(BindSession {
            inner: self.inner.clone(),
            locator: locator.to_string(),
        }))
    }
}

struct BindSession {
    inner: Arc<BindInner>,
    locator: String,
}

#[async_trait]
impl Session for BindSession {
    fn service_locator(&self) -> &str {
        &self.locator
    }

    async fn send_request(&self, request: Bytes) -> Result<Bytes, TransportError> {
        {
            let mut counter = self.inner.abort_counter.lock().unwrap();
            if *counter > 0 {
                *counter -= 1;
                if *counter == 0 {
                    self.inner.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(TransportError::SessionFailed(
                        self.locator.clone(),
                        "server stopped responding".to_string(),
                    ));
                }
            }
        }
        if let Some(message) = self.inner.fail_next.lock().unwrap().take() {
            self.inner.failed.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::SessionFailed(self.locator.clone(), message));
        }

        let mut header_buf = request.clone();
        let header = RequestHeader::decode(&mut header_buf)
            .map_err(|_| TransportError::ServiceNotAvailable(self.locator.clone()))?;
        let service = {
            let services = self.inner.services.read().unwrap();
            services
                .get(&self.locator)
                .and_then(|array| array.get(&header.service.to_wire()))
                .cloned()
                .ok_or_else(|| TransportError::ServiceNotAvailable(self.locator.clone()))?
        };
        let response = service.handle_rpc(request).await;
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::wire::{status_response, Opcode, Status};

    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        async fn handle_rpc(&self, request: Bytes) -> Bytes {
            let mut response = BytesMut::new();
            response.put_u32_le(Status::Ok.to_wire());
            response.extend_from_slice(&request);
            response.freeze()
        }
    }

    fn master_request() -> Bytes {
        let mut buf = BytesMut::new();
        RequestHeader {
            opcode: Opcode::InsertIndexEntry,
            service: ServiceType::Master,
        }
        .encode(&mut buf);
        buf.freeze()
    }

    #[tokio::test]
    async fn dispatches_to_registered_service() {
        let transport = BindTransport::new();
        transport.add_service("mock:host=a", ServiceType::Master, Arc::new(EchoService));
        let session = transport.open_session("mock:host=a").unwrap();
        let response = session.send_request(master_request()).await.unwrap();
        assert!(response.len() > 4);
        assert_eq!(transport.completed_count(), 1);
    }

    #[tokio::test]
    async fn unknown_host_is_an_error() {
        let transport = BindTransport::new();
        assert!(matches!(
            transport.open_session("mock:host=missing"),
            Err(TransportError::UnknownHost(_))
        ));
    }

    #[tokio::test]
    async fn missing_service_type_is_unavailable() {
        let transport = BindTransport::new();
        transport.add_service("mock:host=a", ServiceType::Backup, Arc::new(EchoService));
        let session = transport.open_session("mock:host=a").unwrap();
        let err = session.send_request(master_request()).await.unwrap_err();
        assert!(matches!(err, TransportError::ServiceNotAvailable(_)));
    }

    #[tokio::test]
    async fn abort_counter_fails_the_nth_send() {
        let transport = BindTransport::new();
        transport.add_service("mock:host=a", ServiceType::Master, Arc::new(EchoService));
        let session = transport.open_session("mock:host=a").unwrap();
        transport.set_abort_counter(2);

        session.send_request(master_request()).await.unwrap();
        let err = session.send_request(master_request()).await.unwrap_err();
        assert!(matches!(err, TransportError::SessionFailed(_, _)));
        // Counter exhausted; traffic flows again.
        session.send_request(master_request()).await.unwrap();
        assert_eq!(transport.failed_count(), 1);
        assert_eq!(transport.completed_count(), 2);
    }

    #[tokio::test]
    async fn fail_next_fails_exactly_once() {
        let transport = BindTransport::new();
        transport.add_service("mock:host=a", ServiceType::Master, Arc::new(EchoService));
        let session = transport.open_session("mock:host=a").unwrap();
        transport.fail_next("injected");

        assert!(session.send_request(master_request()).await.is_err());
        assert!(session.send_request(master_request()).await.is_ok());
    }

    #[tokio::test]
    async fn status_only_service_response_round_trips() {
        struct Rejecting;
        #[async_trait]
        impl Service for Rejecting {
            async fn handle_rpc(&self, _request: Bytes) -> Bytes {
                status_response(Status::UnknownIndexlet)
            }
        }
        let transport = BindTransport::new();
        transport.add_service("mock:host=a", ServiceType::Master, Arc::new(Rejecting));
        let session = transport.open_session("mock:host=a").unwrap();
        let response = session.send_request(master_request()).await.unwrap();
        let header = crate::wire::ResponseHeader::decode(&response).unwrap();
        assert_eq!(header.status, Status::UnknownIndexlet);
    }
}
