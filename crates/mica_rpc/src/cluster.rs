//! Cluster server directory consulted when routing server-id RPCs.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

pub type ServerId = u64;

/// Liveness state of one server as last reported by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerState {
    Up,
    Crashed,
    Removed,
}

/// One server's directory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDetails {
    pub server_id: ServerId,
    pub service_locator: String,
    pub state: ServerState,
}

/// Directory of known servers. Server-id RPCs consult this after transport
/// failures to decide between retrying and giving up with `ServerNotUp`.
pub struct ServerList {
    inner: RwLock<BTreeMap<ServerId, ServerDetails>>,
}

impl ServerList {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add or replace a server entry in the `Up` state.
    pub fn add(&self, server_id: ServerId, service_locator: impl Into<String>) {
        self.inner.write().unwrap().insert(
            server_id,
            ServerDetails {
                server_id,
                service_locator: service_locator.into(),
                state: ServerState::Up,
            },
        );
    }

    pub fn mark_crashed(&self, server_id: ServerId) {
        if let Some(details) = self.inner.write().unwrap().get_mut(&server_id) {
            details.state = ServerState::Crashed;
        }
    }

    pub fn remove(&self, server_id: ServerId) {
        self.inner.write().unwrap().remove(&server_id);
    }

    pub fn details(&self, server_id: ServerId) -> Option<ServerDetails> {
        self.inner.read().unwrap().get(&server_id).cloned()
    }

    pub fn is_up(&self, server_id: ServerId) -> bool {
        matches!(
            self.inner.read().unwrap().get(&server_id),
            Some(ServerDetails {
                state: ServerState::Up,
                ..
            })
        )
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}

impl Default for ServerList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_crash_and_remove() {
        let list = ServerList::new();
        assert!(list.is_empty());

        list.add(1, "mock:host=one");
        assert!(list.is_up(1));
        assert_eq!(list.details(1).unwrap().service_locator, "mock:host=one");

        list.mark_crashed(1);
        assert!(!list.is_up(1));
        assert_eq!(list.details(1).unwrap().state, ServerState::Crashed);

        list.remove(1);
        assert!(list.details(1).is_none());
        assert!(!list.is_up(1));
    }
}
