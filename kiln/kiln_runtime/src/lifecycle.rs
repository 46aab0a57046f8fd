//! The per-request lifecycle.
//!
//! Every inbound request walks the same path:
//!
//! ```text
//! Idle -> Acquired -> Dispatched -> Succeeded | Failed -> Recycled
//!                                   Succeeded -> Upgraded -> Recycled
//! ```
//!
//! A container is borrowed from the pool, hosted logic runs against it,
//! the response is classified and, for a valid upgrade request that the
//! application accepted, rewritten into a `101 Switching Protocols`. The
//! container goes back to the pool on every path, including errors,
//! panics and cancellation.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use http::StatusCode;
use kiln_container::context;
use kiln_core::error::{ApplicationError, Error, Result};
use kiln_core::traits::ResponseSink;
use kiln_core::types::{
    clear_body, empty_response, is_successful, Request, RequestMeta, Response, TransportId,
};
use kiln_pool::Lease;
use kiln_socket::{apply_upgrade, upgrade_intent, Connection, ConnectionRegistry};
use tracing::{debug, error, warn};

use crate::application::Application;
use crate::context::ServerContext;
use crate::events::ServerEvent;

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Waiting for a container
    Idle,

    /// Holding a container
    Acquired,

    /// Hosted logic is running
    Dispatched,

    /// Hosted logic answered with 101 or 2xx
    Succeeded,

    /// Anything else, including errors and rejected upgrades
    Failed,

    /// The handshake completed and a connection was registered
    Upgraded,

    /// The container is back in the pool
    Recycled,
}

impl LifecycleState {
    /// Name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquired => "acquired",
            Self::Dispatched => "dispatched",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Upgraded => "upgraded",
            Self::Recycled => "recycled",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a request ended.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Final classification: `Succeeded`, `Failed` or `Upgraded`
    pub state: LifecycleState,

    /// Status of the response that was sent
    pub status: StatusCode,

    /// The connection registered by a completed upgrade
    pub connection: Option<Arc<Connection>>,
}

impl Outcome {
    /// Whether the request upgraded its connection.
    pub fn is_upgraded(&self) -> bool {
        self.state == LifecycleState::Upgraded
    }
}

/// Drives requests through the pool, the hosted application and the
/// upgrade handshake.
#[derive(Clone)]
pub struct RequestLifecycle {
    context: Arc<ServerContext>,
    app: Arc<dyn Application>,
}

impl RequestLifecycle {
    /// Create a lifecycle over the given services and application.
    pub fn new(context: Arc<ServerContext>, app: Arc<dyn Application>) -> Self {
        Self { context, app }
    }

    /// The services this lifecycle uses.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Serve one request arriving on `transport`, sending the response to
    /// `sink`.
    ///
    /// Application errors never surface here; they become a 500 response.
    /// Errors returned are pool closure or timeout (after a 503 was sent),
    /// a duplicate connection (after a 500 was sent), a transport failure
    /// and, fatally, a pool protocol violation.
    pub async fn handle<S>(
        &self,
        transport: TransportId,
        request: Request,
        sink: &mut S,
    ) -> Result<Outcome>
    where
        S: ResponseSink + ?Sized,
    {
        debug!(transport = %transport, state = %LifecycleState::Idle, "Request received");

        let lease = match self.context.pool.acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(transport = %transport, error = %err, "No container available");
                if let Err(send_err) = sink.send(empty_response(StatusCode::SERVICE_UNAVAILABLE)).await {
                    warn!(transport = %transport, error = %send_err, "Failed to send 503");
                }
                return Err(err.into());
            }
        };
        debug!(
            transport = %transport,
            container = %lease.id(),
            state = %LifecycleState::Acquired,
            "Container acquired"
        );

        let intent = upgrade_intent(request.headers());
        let meta = RequestMeta::from_request(&request);

        debug!(transport = %transport, state = %LifecycleState::Dispatched, "Dispatching request");
        let mut response = self.dispatch(&lease, transport, request).await;

        let mut state = if is_successful(response.status()) {
            LifecycleState::Succeeded
        } else {
            LifecycleState::Failed
        };
        debug!(transport = %transport, status = %response.status(), state = %state, "Request classified");

        let mut pending = None;
        let mut failure: Option<Error> = None;

        match intent {
            None => {}
            Some(Ok(key)) if state == LifecycleState::Succeeded => {
                apply_upgrade(&mut response, &key);
                match self.context.registry.register(
                    transport,
                    meta.clone(),
                    Arc::clone(&self.context.server),
                ) {
                    Ok(registered) => {
                        pending = Some(PendingConnection::new(&self.context.registry, registered))
                    }
                    Err(err) => {
                        response = empty_response(StatusCode::INTERNAL_SERVER_ERROR);
                        state = LifecycleState::Failed;
                        failure = Some(err.into());
                    }
                }
            }
            Some(Err(err)) if state == LifecycleState::Succeeded => {
                debug!(transport = %transport, error = %err, "Rejecting upgrade with bad key");
                response = empty_response(StatusCode::BAD_REQUEST);
                state = LifecycleState::Failed;
            }
            Some(_) => clear_body(&mut response),
        }

        let status = response.status();
        if let Err(err) = sink.send(response).await {
            warn!(transport = %transport, error = %err, "Failed to send response");
            if pending.take().is_some() {
                state = LifecycleState::Failed;
            }
            failure.get_or_insert(err.into());
        }
        let connection = pending.and_then(PendingConnection::commit);

        if let Some(registered) = &connection {
            state = LifecycleState::Upgraded;
            self.context.events.publish(ServerEvent::ConnectionOpened {
                transport,
                connection: registered.id,
                request: meta,
            });
        }

        let container = lease.id();
        self.context.pool.recycle(lease)?;
        debug!(
            transport = %transport,
            container = %container,
            status = %status,
            outcome = %state,
            state = %LifecycleState::Recycled,
            "Request finished"
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(Outcome {
                state,
                status,
                connection,
            }),
        }
    }

    /// Run hosted logic with the leased container installed as the current
    /// container. Always yields a response.
    async fn dispatch(&self, lease: &Lease, transport: TransportId, request: Request) -> Response {
        let call = self.app.handle(lease, request);
        let result = context::scope(
            Arc::clone(lease.container()),
            AssertUnwindSafe(call).catch_unwind(),
        )
        .await;

        let err = match result {
            Ok(Ok(response)) => return response,
            Ok(Err(err)) => {
                warn!(transport = %transport, container = %lease.id(), error = %err, "Application error");
                err
            }
            Err(payload) => {
                let err = ApplicationError::Panicked(panic_message(payload.as_ref()));
                error!(transport = %transport, container = %lease.id(), error = %err, "Application panicked");
                err
            }
        };

        debug!(transport = %transport, error = %err, "Answering with 500");
        empty_response(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// A registered connection whose handshake response has not reached the
/// client yet. Dropping it, on a send failure or when the request task is
/// cancelled mid-send, removes the registration.
struct PendingConnection<'a> {
    registry: &'a ConnectionRegistry,
    connection: Option<Arc<Connection>>,
}

impl<'a> PendingConnection<'a> {
    fn new(registry: &'a ConnectionRegistry, connection: Arc<Connection>) -> Self {
        Self {
            registry,
            connection: Some(connection),
        }
    }

    /// Keep the registration.
    fn commit(mut self) -> Option<Arc<Connection>> {
        self.connection.take()
    }
}

impl Drop for PendingConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(
                transport = %connection.transport,
                connection = %connection.id,
                "Handshake response not delivered, dropping connection"
            );
            self.registry.unregister(&connection);
        }
    }
}

impl fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
