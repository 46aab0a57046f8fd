//! Data structures shared by every Kiln crate.

pub mod http;
pub mod server;
pub mod transport;

pub use self::http::{clear_body, empty_response, is_successful, Request, Response};
pub use server::ServerInfo;
pub use transport::{RequestMeta, TransportId};
