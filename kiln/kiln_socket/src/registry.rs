//! Registry of upgraded connections.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_core::error::RegistryError;
use kiln_core::id::ConnectionId;
use kiln_core::types::{RequestMeta, ServerInfo, TransportId};
use tracing::{debug, error};

/// An upgraded session.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identity of the session
    pub id: ConnectionId,

    /// Transport the session lives on
    pub transport: TransportId,

    /// Metadata of the request that opened the session
    pub request: RequestMeta,

    /// Server that accepted the session
    pub server: Arc<ServerInfo>,

    /// When the handshake completed
    pub opened_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection record for a completed handshake.
    pub fn new(transport: TransportId, request: RequestMeta, server: Arc<ServerInfo>) -> Self {
        Self {
            id: ConnectionId::new(),
            transport,
            request,
            server,
            opened_at: Utc::now(),
        }
    }
}

/// Upgraded sessions keyed by transport.
///
/// At most one connection exists per transport. Entries are added when a
/// handshake completes and removed by the transport layer when the socket
/// closes.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<TransportId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed handshake.
    ///
    /// An existing entry for the same transport is never overwritten; it
    /// means a replayed handshake or a transport that was never released.
    pub fn register(
        &self,
        transport: TransportId,
        request: RequestMeta,
        server: Arc<ServerInfo>,
    ) -> Result<Arc<Connection>, RegistryError> {
        match self.connections.entry(transport) {
            Entry::Occupied(existing) => {
                error!(
                    transport = %transport,
                    existing = %existing.get().id,
                    "Duplicate connection for transport"
                );
                Err(RegistryError::DuplicateConnection(transport))
            }
            Entry::Vacant(slot) => {
                let connection = Arc::new(Connection::new(transport, request, server));
                debug!(transport = %transport, connection = %connection.id, "Registered connection");
                slot.insert(Arc::clone(&connection));
                Ok(connection)
            }
        }
    }

    /// Look up the connection on a transport.
    pub fn get(&self, transport: TransportId) -> Option<Arc<Connection>> {
        self.connections
            .get(&transport)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a transport carries an upgraded session.
    pub fn contains(&self, transport: TransportId) -> bool {
        self.connections.contains_key(&transport)
    }

    /// Forget the connection on a closed transport.
    pub fn release(&self, transport: TransportId) -> Option<Arc<Connection>> {
        let released = self.connections.remove(&transport).map(|(_, connection)| connection);
        if let Some(connection) = &released {
            debug!(transport = %transport, connection = %connection.id, "Released connection");
        }
        released
    }

    /// Remove `connection` if it is still the one registered on its
    /// transport. A newer connection on the same transport is left alone.
    pub fn unregister(&self, connection: &Connection) -> bool {
        let removed = self
            .connections
            .remove_if(&connection.transport, |_, current| current.id == connection.id)
            .is_some();
        if removed {
            debug!(transport = %connection.transport, connection = %connection.id, "Unregistered connection");
        }
        removed
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
