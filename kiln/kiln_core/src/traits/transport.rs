//! The outbound half of the transport contract.

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::Response;

/// Accepts the final response for one inbound request.
///
/// The transport implements this for whatever owns the client socket. The
/// request lifecycle calls [`send`](ResponseSink::send) exactly once per
/// request, after any upgrade rewriting and before the upgrade
/// notification is published.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use kiln_core::error::TransportError;
/// use kiln_core::traits::ResponseSink;
/// use kiln_core::types::Response;
///
/// #[derive(Default)]
/// struct Recorder(Vec<Response>);
///
/// #[async_trait]
/// impl ResponseSink for Recorder {
///     async fn send(&mut self, response: Response) -> Result<(), TransportError> {
///         self.0.push(response);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait ResponseSink: Send {
    /// Deliver the response to the client.
    async fn send(&mut self, response: Response) -> Result<(), TransportError>;
}

/// Collecting into a vector, handy in tests and in-process callers.
#[async_trait]
impl ResponseSink for Vec<Response> {
    async fn send(&mut self, response: Response) -> Result<(), TransportError> {
        self.push(response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::empty_response;
    use http::StatusCode;

    #[tokio::test]
    async fn test_vec_sink_collects() {
        let mut sink: Vec<Response> = Vec::new();
        sink.send(empty_response(StatusCode::OK)).await.unwrap();
        sink.send(empty_response(StatusCode::FORBIDDEN)).await.unwrap();

        let statuses: Vec<_> = sink.iter().map(|r| r.status()).collect();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::FORBIDDEN]);
    }
}
