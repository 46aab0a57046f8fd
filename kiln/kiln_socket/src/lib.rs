//! # Kiln Socket
//!
//! The protocol upgrade half of Kiln:
//!
//! - [`handshake`]: detecting upgrade intent, validating the client key and
//!   computing the accept token.
//! - [`registry`]: the table of upgraded sessions, keyed by transport.

pub mod handshake;
pub mod registry;

pub use handshake::{apply_upgrade, compute_accept, upgrade_intent, validate, HandshakeKey};
pub use registry::{Connection, ConnectionRegistry};
