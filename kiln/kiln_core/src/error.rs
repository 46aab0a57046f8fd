//! Error types for the Kiln pool and upgrade lifecycle.
//!
//! Each subsystem owns its own error enum. The root [`Error`] wraps all of
//! them so that the request lifecycle can report any failure uniformly.
//!
//! Only [`BootstrapError`] and [`PoolError::ProtocolViolation`] are fatal:
//! both mean the pool can no longer be trusted to hand out valid
//! containers. Everything else is contained within a single request.

use crate::id::ContainerId;
use crate::types::TransportId;
use thiserror::Error;

/// Root error type for Kiln.
#[derive(Debug, Error)]
pub enum Error {
    /// Pool fill failed at startup
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// Instance pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Capability resolution errors
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    /// Hosted application failures
    #[error("Application error: {0}")]
    Application(#[from] ApplicationError),

    /// Upgrade header validation failures
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Connection registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Outbound response delivery errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Graceful shutdown errors
    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the process can no longer serve traffic.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Bootstrap(_) | Self::Pool(PoolError::ProtocolViolation { .. })
        )
    }
}

/// Errors raised while filling the pool at startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The pool was configured with zero capacity
    #[error("Pool capacity must be at least 1")]
    InvalidCapacity,

    /// The bootstrapper failed to produce a container
    #[error("Failed to boot instance {index}: {reason}")]
    BootFailed {
        /// Position of the failing instance in the fill sequence
        index: usize,

        /// Reason reported by the bootstrapper
        reason: String,
    },

    /// A rebind entry names a capability the booted container does not bind
    #[error("Rebind table names unknown capability: {capability}")]
    UnknownCapability {
        /// The capability key
        capability: String,
    },
}

/// Errors related to the instance pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was closed while waiting, or before the call
    #[error("Instance pool is closed")]
    Closed,

    /// Timed out waiting for an idle container
    #[error("Timed out after {0}ms waiting for an idle container")]
    Timeout(u64),

    /// No idle container and the caller asked not to wait
    #[error("No idle container available")]
    Exhausted,

    /// The acquire/recycle protocol was broken by the caller
    #[error("Pool protocol violation for container {container}: {reason}")]
    ProtocolViolation {
        /// The container involved
        container: ContainerId,

        /// What went wrong
        reason: &'static str,
    },
}

/// Errors raised while resolving capabilities from a container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Nothing is bound under the key
    #[error("Capability not bound: {0}")]
    NotBound(String),

    /// The bound value is not of the requested type
    #[error("Capability {key} is not a {expected}")]
    TypeMismatch {
        /// The capability key
        key: String,

        /// Name of the requested type
        expected: &'static str,
    },

    /// A rebind factory panicked; the capability was left unbound
    #[error("Rebinding {key} failed: {reason}")]
    RebindFailed {
        /// The capability key
        key: String,

        /// The panic message
        reason: String,
    },
}

/// Failures reported by, or caught around, hosted application logic.
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// The handler returned an error
    #[error("{0}")]
    Handler(String),

    /// The handler panicked
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl ApplicationError {
    /// Wrap any displayable error as a handler failure.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        Self::Handler(err.to_string())
    }
}

/// Upgrade header validation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// No `Upgrade: websocket` header
    #[error("Missing or unsupported Upgrade header")]
    MissingUpgrade,

    /// `Connection` header does not contain the `Upgrade` token
    #[error("Connection header does not request an upgrade")]
    MissingConnectionUpgrade,

    /// No usable `Sec-WebSocket-Key` header
    #[error("Missing Sec-WebSocket-Key header")]
    MissingKey,

    /// The key is present but not a base64 encoded 16 byte nonce
    #[error("Malformed Sec-WebSocket-Key: {0}")]
    MalformedKey(String),
}

/// Errors related to the connection registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A connection is already registered for this transport
    #[error("Connection already registered for transport {0}")]
    DuplicateConnection(TransportId),
}

/// Errors raised by the transport when sending a response.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The response could not be written
    #[error("Failed to send response: {0}")]
    SendFailed(String),

    /// The peer went away before the response was sent
    #[error("Transport {0} is closed")]
    Closed(TransportId),
}

/// Errors raised during graceful shutdown.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Containers were still on loan when the drain timeout elapsed
    #[error("Shutdown timed out with {on_loan} container(s) still on loan")]
    Timeout {
        /// Containers not yet recycled
        on_loan: usize,
    },

    /// Shutdown was already requested
    #[error("Shutdown already in progress")]
    AlreadyInProgress,
}

/// Result type used throughout Kiln.
pub type Result<T> = std::result::Result<T, Error>;
