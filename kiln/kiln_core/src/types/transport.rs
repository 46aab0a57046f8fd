//! Transport identity and request metadata.

use std::fmt;

use http::{HeaderMap, Method, Uri, Version};
use serde::{Deserialize, Serialize};

use super::http::Request;

/// Opaque token the transport uses to identify one client connection.
///
/// Plays the role of a file descriptor: unique among live connections of
/// a worker, and the key of the connection registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransportId(u64);

impl TransportId {
    /// Wrap a raw transport token.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw transport token.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TransportId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// The parts of an inbound request that outlive its dispatch.
///
/// Captured before the request is handed to hosted logic, and carried by
/// connections and upgrade notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    /// Request method
    pub method: Method,

    /// Request target
    pub uri: Uri,

    /// Protocol version
    pub version: Version,

    /// Request headers
    pub headers: HeaderMap,
}

impl RequestMeta {
    /// Capture the metadata of a request.
    pub fn from_request(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
        }
    }

    /// The request path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

impl From<&Request> for RequestMeta {
    fn from(request: &Request) -> Self {
        Self::from_request(request)
    }
}
