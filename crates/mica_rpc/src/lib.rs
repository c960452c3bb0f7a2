//! Transport-agnostic RPC plumbing for the Mica cluster.
//!
//! This crate carries the pieces every Mica client and server shares: the
//! wire format, the session-oriented transport traits, the cluster server
//! directory, and the retryable RPC state machine that drives a request
//! through resolve/send/inspect cycles until it reaches a terminal state.
//! Concrete transports plug in underneath; the `bind` module provides an
//! in-process one used by tests and single-process deployments.

use std::sync::Arc;
use std::time::Duration;

pub mod bind;
pub mod cluster;
pub mod transport;
pub mod wire;
pub mod wrapper;

use cluster::ServerList;
use transport::TransportManager;

/// Retry tuning shared by RPC wrappers that back off between attempts.
#[derive(Clone, Copy, Debug)]
pub struct RpcConfig {
    /// First delay after a retryable failure.
    pub backoff_base: Duration,
    /// Upper bound on any single backoff delay.
    pub backoff_max: Duration,
    /// Largest left-shift applied to the base delay.
    pub backoff_max_shift: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_secs(1),
            backoff_max_shift: 6,
        }
    }
}

/// Shared handles threaded through every client-side component.
///
/// There are no hidden singletons: anything that needs to resolve sessions
/// or consult the server directory receives an `Arc<Context>` explicitly.
pub struct Context {
    pub transport_manager: TransportManager,
    pub server_list: ServerList,
    pub rpc_config: RpcConfig,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transport_manager: TransportManager::new(),
            server_list: ServerList::new(),
            rpc_config: RpcConfig::default(),
        })
    }

    pub fn with_config(rpc_config: RpcConfig) -> Arc<Self> {
        Arc::new(Self {
            transport_manager: TransportManager::new(),
            server_list: ServerList::new(),
            rpc_config,
        })
    }
}
