//! The server facade.
//!
//! Ties the configuration, the filled pool, the connection registry and the
//! event bus together, and owns graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_container::RebindTable;
use kiln_core::error::ShutdownError;
use kiln_core::traits::ResponseSink;
use kiln_core::types::{Request, TransportId};
use kiln_core::utils::init_tracing;
use kiln_pool::{Bootstrapper, InstancePool};
use kiln_socket::Connection;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{error, info};

use crate::application::Application;
use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::events::ServerEvent;
use crate::lifecycle::{Outcome, RequestLifecycle};

/// A running Kiln server.
///
/// The transport layer feeds it requests through [`handle`](Self::handle)
/// and reports closed sockets through
/// [`release_connection`](Self::release_connection).
pub struct Server {
    config: ServerConfig,
    lifecycle: RequestLifecycle,
    shutdown_tx: broadcast::Sender<()>,
    in_progress: Mutex<bool>,
}

impl Server {
    /// Validate `config`, fill the pool and wire the request lifecycle.
    ///
    /// Fails without serving anything if any container fails to boot.
    pub fn start<B>(
        config: ServerConfig,
        bootstrapper: &B,
        rebind: RebindTable,
        app: Arc<dyn Application>,
    ) -> Result<Self>
    where
        B: Bootstrapper + ?Sized,
    {
        config.validate()?;
        init_tracing(&config.logging);

        info!(
            name = %config.name,
            address = %config.server_info().address(),
            capacity = config.pool.capacity,
            "Starting server"
        );

        let pool = InstancePool::fill(config.pool.instance_pool(), bootstrapper, rebind)
            .context("Failed to fill instance pool")?;

        let context = Arc::new(ServerContext::new(
            pool,
            config.server_info(),
            config.events.channel_buffer_size,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(name = %config.name, "Server ready");

        Ok(Self {
            lifecycle: RequestLifecycle::new(context, app),
            config,
            shutdown_tx,
            in_progress: Mutex::new(false),
        })
    }

    /// Serve one request. See [`RequestLifecycle::handle`].
    pub async fn handle<S>(
        &self,
        transport: TransportId,
        request: Request,
        sink: &mut S,
    ) -> kiln_core::Result<Outcome>
    where
        S: ResponseSink + ?Sized,
    {
        self.lifecycle.handle(transport, request, sink).await
    }

    /// Forget the connection on a transport that closed.
    pub fn release_connection(&self, transport: TransportId) -> Option<Arc<Connection>> {
        self.context().registry.release(transport)
    }

    /// Subscribe to server events.
    pub fn subscribe(&self) -> mpsc::Receiver<ServerEvent> {
        self.context().events.subscribe()
    }

    /// Receive a signal when shutdown begins.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Shared services.
    pub fn context(&self) -> &Arc<ServerContext> {
        self.lifecycle.context()
    }

    /// The request lifecycle, for callers that drive it directly.
    pub fn lifecycle(&self) -> &RequestLifecycle {
        &self.lifecycle
    }

    /// The configuration the server started with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stop accepting work and wait for every container to come back.
    ///
    /// Waiting requests fail with `PoolError::Closed`; requests already
    /// holding a container run to completion, bounded by the configured
    /// shutdown timeout.
    pub async fn shutdown(&self) -> std::result::Result<(), ShutdownError> {
        {
            let mut in_progress = self.in_progress.lock();
            if *in_progress {
                return Err(ShutdownError::AlreadyInProgress);
            }
            *in_progress = true;
        }

        let pool = &self.context().pool;
        info!(on_loan = pool.on_loan_count(), "Shutting down server");

        // No receivers is fine.
        let _ = self.shutdown_tx.send(());
        pool.close();

        let limit = self.config.shutdown_timeout();
        match timeout(limit, pool.wait_idle()).await {
            Ok(()) => {
                info!("Shutdown complete");
                Ok(())
            }
            Err(_) => {
                let on_loan = pool.on_loan_count();
                error!(on_loan, timeout = ?limit, "Shutdown timed out");
                Err(ShutdownError::Timeout { on_loan })
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.config.name)
            .field("pool", &self.context().pool)
            .finish_non_exhaustive()
    }
}
