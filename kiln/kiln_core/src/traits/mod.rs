//! Interfaces Kiln expects from its collaborators.

pub mod transport;

pub use transport::ResponseSink;
