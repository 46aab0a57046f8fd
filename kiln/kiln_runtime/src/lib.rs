//! # Kiln Runtime
//!
//! Puts the Kiln pieces to work: configuration, the request lifecycle that
//! drives every inbound request through the instance pool and the upgrade
//! handshake, server event notifications, and the [`Server`] facade with
//! graceful shutdown.
//!
//! ## Modules
//!
//! - **application**: the contract hosted logic implements
//! - **config**: server configuration loading and validation
//! - **context**: shared services passed to the lifecycle
//! - **events**: the event bus and listeners
//! - **lifecycle**: the per-request state machine
//! - **server**: startup, request entry point and shutdown

pub mod application;
pub mod config;
pub mod context;
pub mod events;
pub mod lifecycle;
pub mod server;

pub use application::Application;
pub use config::{ConfigError, ServerConfig};
pub use context::ServerContext;
pub use events::{spawn_listener, EventBus, EventListener, ServerEvent};
pub use lifecycle::{LifecycleState, Outcome, RequestLifecycle};
pub use server::Server;
