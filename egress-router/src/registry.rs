//! Live mapping from identity to the connection currently serving it.
//!
//! Entries only exist for verified registrations (or, with no handle, for identities known
//! from the store). A connection may transiently back several identities while an instance
//! re-registers, so disconnects are resolved by handle, not by identity.

use crate::errors::RelayError;
use crate::metrics_defs::CONNECTED_INSTANCES;
use crate::protocol::RelayMessage;
use parking_lot::RwLock;
use repo_store::Identity;
use shared::gauge;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

pub type ConnectionId = u64;

/// Sending half of one instance's channel. Compared by connection id.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<RelayMessage>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a message for the instance. Fails once the connection has gone away.
    pub async fn send(&self, message: RelayMessage) -> Result<(), mpsc::error::SendError<RelayMessage>> {
        self.tx.send(message).await
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

/// Outcome of looking up an identity.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    Live(ConnectionHandle),
    /// Known identity without a live connection.
    Offline,
    Unknown,
}

impl Resolution {
    pub fn into_handle(self, identity: &str) -> Result<ConnectionHandle, RelayError> {
        use crate::errors::UnresolvedReason;

        let reason = match self {
            Resolution::Live(handle) => return Ok(handle),
            Resolution::Offline => UnresolvedReason::NotConnected,
            Resolution::Unknown => UnresolvedReason::Unknown,
        };
        Err(RelayError::Unresolved {
            identity: identity.to_string(),
            reason,
        })
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<Identity, Option<ConnectionHandle>>,
    // Identities whose instance declared an unsupported version, with the offending connection
    incompatible: HashMap<Identity, ConnectionId>,
}

#[derive(Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
    next_connection_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the registry with identities that have no live connection yet.
    pub fn add_known<I>(&self, identities: I)
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut inner = self.inner.write();
        for identity in identities {
            inner.connections.entry(identity).or_insert(None);
        }
    }

    /// Allocates a handle for a freshly accepted connection. The handle is not associated
    /// with any identity until `register` is called.
    pub fn connect(&self, tx: mpsc::Sender<RelayMessage>) -> ConnectionHandle {
        ConnectionHandle {
            id: self.next_connection_id.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// Binds `identity` to `handle`. The last verified connection wins.
    pub fn register(&self, identity: &str, handle: &ConnectionHandle) {
        let mut inner = self.inner.write();
        let previous = inner
            .connections
            .insert(identity.to_string(), Some(handle.clone()))
            .flatten();
        // A compatible registration supersedes an earlier version mismatch
        inner.incompatible.remove(identity);

        if let Some(previous) = previous
            && previous != *handle
        {
            tracing::info!(
                identity,
                previous = previous.id(),
                connection = handle.id(),
                "Replacing connection for identity"
            );
        }

        gauge!(CONNECTED_INSTANCES).set(live_count(&inner) as f64);
    }

    pub fn resolve(&self, identity: &str) -> Resolution {
        match self.inner.read().connections.get(identity) {
            Some(Some(handle)) => Resolution::Live(handle.clone()),
            Some(None) => Resolution::Offline,
            None => Resolution::Unknown,
        }
    }

    /// Releases every identity bound to `handle` and clears any incompatible marker raised
    /// on it. Returns the identities that were bound.
    pub fn unregister(&self, handle: &ConnectionHandle) -> Vec<Identity> {
        let mut inner = self.inner.write();

        let mut released = Vec::new();
        for (identity, slot) in inner.connections.iter_mut() {
            if slot.as_ref() == Some(handle) {
                *slot = None;
                released.push(identity.clone());
            }
        }
        inner
            .incompatible
            .retain(|_, connection| *connection != handle.id());

        gauge!(CONNECTED_INSTANCES).set(live_count(&inner) as f64);
        released
    }

    pub fn mark_incompatible(&self, identity: &str, handle: &ConnectionHandle) {
        self.inner
            .write()
            .incompatible
            .insert(identity.to_string(), handle.id());
    }

    pub fn is_incompatible(&self, identity: &str) -> bool {
        self.inner.read().incompatible.contains_key(identity)
    }

    pub fn connected_count(&self) -> usize {
        live_count(&self.inner.read())
    }
}

fn live_count(inner: &RegistryInner) -> usize {
    inner.connections.values().filter(|slot| slot.is_some()).count()
}
