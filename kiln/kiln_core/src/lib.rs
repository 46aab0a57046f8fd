//! # Kiln Core
//!
//! Shared building blocks for the Kiln warm application pool: the error
//! hierarchy, typed identifiers, the request/response values exchanged with
//! hosted logic, and the transport contract.
//!
//! ## Crate Structure
//!
//! - **error**: error types for every Kiln subsystem
//! - **id**: strongly-typed identifiers
//! - **traits**: interfaces implemented by collaborators
//! - **types**: request, response, transport and server values
//! - **utils**: logging setup

pub mod error;
pub mod id;
pub mod traits;
pub mod types;
pub mod utils;

pub use error::{Error, Result};
pub use id::{ConnectionId, ContainerId, PoolId};
pub use traits::ResponseSink;
pub use types::{Request, RequestMeta, Response, ServerInfo, TransportId};
pub use utils::{LogLevel, LoggingConfig};
