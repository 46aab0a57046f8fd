//! Shared services handed to the request lifecycle.

use std::sync::Arc;

use kiln_core::types::ServerInfo;
use kiln_pool::InstancePool;
use kiln_socket::ConnectionRegistry;

use crate::events::EventBus;

/// Everything a request needs besides the request itself.
///
/// Built once by the server and passed explicitly to the lifecycle; there
/// is no global lookup.
#[derive(Debug, Clone)]
pub struct ServerContext {
    /// Warm containers, with the rebind table they are recycled with
    pub pool: Arc<InstancePool>,

    /// Upgraded sessions
    pub registry: Arc<ConnectionRegistry>,

    /// Notification fan-out
    pub events: Arc<EventBus>,

    /// Server reference recorded on every connection
    pub server: Arc<ServerInfo>,
}

impl ServerContext {
    /// Wire a context around a filled pool.
    pub fn new(pool: Arc<InstancePool>, server: ServerInfo, event_buffer: usize) -> Self {
        Self {
            pool,
            registry: Arc::new(ConnectionRegistry::new()),
            events: Arc::new(EventBus::new(event_buffer)),
            server: Arc::new(server),
        }
    }
}
