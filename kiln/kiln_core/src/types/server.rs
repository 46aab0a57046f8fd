//! The server reference carried by upgraded connections.

use serde::{Deserialize, Serialize};

/// Identity of the server process that accepted a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name
    pub name: String,

    /// Advertised host
    pub host: String,

    /// Advertised port
    pub port: u16,
}

impl ServerInfo {
    /// Create a server reference.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` form of the advertised address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
