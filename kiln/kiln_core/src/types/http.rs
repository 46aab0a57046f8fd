//! Request and response values exchanged with hosted logic.
//!
//! Kiln never touches sockets. The transport hands over fully read
//! requests and takes back complete responses, so both are plain
//! `http` values with a `Bytes` body.

use bytes::Bytes;
use http::{header, StatusCode};

/// An inbound request.
pub type Request = http::Request<Bytes>;

/// An outbound response.
pub type Response = http::Response<Bytes>;

/// Whether a status counts as success for the upgrade branch.
///
/// Success is `101 Switching Protocols` or anything in `[200, 300)`.
pub fn is_successful(status: StatusCode) -> bool {
    status == StatusCode::SWITCHING_PROTOCOLS || status.is_success()
}

/// Build a response with the given status and no body.
pub fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

/// Drop the body of a response, along with a now stale `Content-Length`.
pub fn clear_body(response: &mut Response) {
    *response.body_mut() = Bytes::new();
    response.headers_mut().remove(header::CONTENT_LENGTH);
}
