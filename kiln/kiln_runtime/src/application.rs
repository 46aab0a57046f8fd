//! The contract for hosted application logic.

use async_trait::async_trait;
use kiln_container::Container;
use kiln_core::error::ApplicationError;
use kiln_core::types::{Request, Response};

/// Hosted request handling logic.
///
/// Called once per dispatch, possibly from many tasks at once, each time
/// with a different borrowed container. Implementations must not keep
/// handles to the container, or to capabilities listed in the rebind
/// table, past the call.
///
/// Errors and panics are caught by the request lifecycle and turned into a
/// `500 Internal Server Error`.
#[async_trait]
pub trait Application: Send + Sync + 'static {
    /// Produce the response for `request`.
    async fn handle(
        &self,
        container: &Container,
        request: Request,
    ) -> Result<Response, ApplicationError>;
}
