//! [`ConnectionRegistry`] – the set of open device links.
//!
//! The registry keeps two views over the same connections, `port → link`
//! and `identity → link`, behind a single [`RwLock`].  Every mutation updates
//! both views under the write lock, so a reader never observes a connection
//! reachable from one view but not the other.
//!
//! The polling loop iterates a point-in-time [`snapshot`][ConnectionRegistry::all]
//! rather than the live maps, so registration or eviction during a sweep
//! never invalidates the iteration.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use commutator_types::{CommutatorError, DeviceId};
use tracing::{info, warn};

use crate::connection::Connection;

#[derive(Default)]
struct Views {
    by_port: HashMap<String, Arc<Connection>>,
    by_identity: HashMap<DeviceId, Arc<Connection>>,
}

/// Dual-indexed registry of live [`Connection`]s.
#[derive(Default)]
pub struct ConnectionRegistry {
    views: RwLock<Views>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Views> {
        self.views.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Views> {
        self.views.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index a bound connection under its port and its identity.
    ///
    /// Registration is all-or-nothing: on error neither view changes.
    ///
    /// # Errors
    ///
    /// * [`CommutatorError::UnboundConnection`] – the connection has no identity.
    /// * [`CommutatorError::PortInUse`] – the port is already registered.
    /// * [`CommutatorError::IdentityInUse`] – another link already carries the identity.
    pub fn register(&self, connection: Arc<Connection>) -> Result<(), CommutatorError> {
        let port = connection.port().to_string();
        let Some(identity) = connection.identity().cloned() else {
            warn!(port = %port, "refusing to register unbound connection");
            return Err(CommutatorError::UnboundConnection(port));
        };

        let mut views = self.write();
        if views.by_port.contains_key(&port) {
            warn!(port = %port, identity = %identity, "port already registered");
            return Err(CommutatorError::PortInUse(port));
        }
        if views.by_identity.contains_key(&identity) {
            warn!(port = %port, identity = %identity, "identity already bound to another port");
            return Err(CommutatorError::IdentityInUse(identity));
        }

        views.by_port.insert(port.clone(), Arc::clone(&connection));
        views.by_identity.insert(identity.clone(), connection);
        info!(port = %port, identity = %identity, "connection registered");
        Ok(())
    }

    pub fn lookup_by_identity(&self, identity: &str) -> Option<Arc<Connection>> {
        self.read().by_identity.get(identity).cloned()
    }

    pub fn lookup_by_port(&self, port: &str) -> Option<Arc<Connection>> {
        self.read().by_port.get(port).cloned()
    }

    /// Drop `connection` from both views.
    ///
    /// Only removes the entries if they still point at this exact instance,
    /// so a stale handle cannot evict a replacement.  Returns whether
    /// anything was removed.
    pub fn remove(&self, connection: &Connection) -> bool {
        let mut views = self.write();
        let registered = views
            .by_port
            .get(connection.port())
            .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), connection));
        if !registered {
            return false;
        }

        views.by_port.remove(connection.port());
        if let Some(identity) = connection.identity() {
            views.by_identity.remove(identity);
        }
        true
    }

    /// Point-in-time copy of every registered connection, ordered by port.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        let mut snapshot: Vec<Arc<Connection>> = self.read().by_port.values().cloned().collect();
        snapshot.sort_by(|a, b| a.port().cmp(b.port()));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.read().by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty both views and return what they held.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut views = self.write();
        views.by_identity.clear();
        views.by_port.drain().map(|(_, conn)| conn).collect()
    }

    /// Remove and close every connection.  Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let connections = self.drain();
        for connection in &connections {
            connection.close().await;
        }
        connections.len()
    }
}
