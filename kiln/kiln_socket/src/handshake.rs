//! The WebSocket opening handshake (RFC 6455, section 4).
//!
//! A request asks for an upgrade with three headers: `Upgrade: websocket`,
//! a `Connection` header listing the `Upgrade` token, and a
//! `Sec-WebSocket-Key`. The server proves it understood by answering with
//! `Sec-WebSocket-Accept`, the base64 SHA-1 digest of the key followed by
//! a fixed GUID.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::{self, HeaderMap, HeaderValue};
use http::StatusCode;
use kiln_core::error::HandshakeError;
use kiln_core::types::{clear_body, Response};
use sha1::{Digest, Sha1};

/// GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Decoded length of a well-formed client key.
const KEY_NONCE_LEN: usize = 16;

/// Compute the accept token for a client key.
///
/// ```
/// use kiln_socket::compute_accept;
///
/// assert_eq!(
///     compute_accept("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// A validated client key together with its accept token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeKey {
    key: String,
    accept: HeaderValue,
}

impl HandshakeKey {
    /// Validate a raw `Sec-WebSocket-Key` value.
    pub fn parse(raw: &str) -> Result<Self, HandshakeError> {
        let key = raw.trim();
        if key.is_empty() {
            return Err(HandshakeError::MissingKey);
        }

        let nonce = STANDARD
            .decode(key)
            .map_err(|e| HandshakeError::MalformedKey(e.to_string()))?;
        if nonce.len() != KEY_NONCE_LEN {
            return Err(HandshakeError::MalformedKey(format!(
                "expected a {} byte nonce, got {} bytes",
                KEY_NONCE_LEN,
                nonce.len()
            )));
        }

        let accept = HeaderValue::from_str(&compute_accept(key))
            .map_err(|e| HandshakeError::MalformedKey(e.to_string()))?;

        Ok(Self {
            key: key.to_string(),
            accept,
        })
    }

    /// The client key as sent.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The accept token for this key.
    pub fn accept(&self) -> &str {
        // Base64 output is always visible ASCII.
        self.accept.to_str().unwrap_or_default()
    }
}

/// Whether any value of `name` contains `token` as a comma separated,
/// case-insensitive list element.
fn has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

/// Validate the upgrade headers of a request.
///
/// Checks run in order: `Upgrade`, `Connection`, presence of the key, then
/// the key's format.
pub fn validate(headers: &HeaderMap) -> Result<HandshakeKey, HandshakeError> {
    if !has_token(headers, header::UPGRADE, "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !has_token(headers, header::CONNECTION, "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }

    let raw = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::MissingKey)?
        .to_str()
        .map_err(|e| HandshakeError::MalformedKey(e.to_string()))?;

    HandshakeKey::parse(raw)
}

/// Decide whether a request is an upgrade attempt.
///
/// `None` means the request is an ordinary one: at least one of the three
/// upgrade signals is missing. `Some(Err(_))` means every signal is present
/// but the key is unusable, which is a failed upgrade attempt rather than
/// an ordinary request.
pub fn upgrade_intent(headers: &HeaderMap) -> Option<Result<HandshakeKey, HandshakeError>> {
    match validate(headers) {
        Ok(key) => Some(Ok(key)),
        Err(err @ HandshakeError::MalformedKey(_)) => Some(Err(err)),
        Err(_) => None,
    }
}

/// Rewrite a successful hosted response into a `101 Switching Protocols`.
///
/// Hosted headers other than the upgrade headers are kept; the body is
/// dropped.
pub fn apply_upgrade(response: &mut Response, key: &HandshakeKey) {
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, key.accept.clone());

    clear_body(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    fn upgrade_headers(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_str(key).unwrap());
        headers
    }

    #[test]
    fn test_rfc_accept_vector() {
        assert_eq!(compute_accept(SAMPLE_KEY), SAMPLE_ACCEPT);
    }

    #[test]
    fn test_validate_accepts_rfc_request() {
        let key = validate(&upgrade_headers(SAMPLE_KEY)).unwrap();
        assert_eq!(key.as_str(), SAMPLE_KEY);
        assert_eq!(key.accept(), SAMPLE_ACCEPT);
    }

    #[test]
    fn test_header_tokens_are_case_insensitive() {
        let mut headers = upgrade_headers(SAMPLE_KEY);
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        assert!(validate(&headers).is_ok());
    }

    #[test]
    fn test_validate_reports_first_missing_signal() {
        let mut headers = upgrade_headers(SAMPLE_KEY);
        headers.remove(header::UPGRADE);
        assert_eq!(validate(&headers), Err(HandshakeError::MissingUpgrade));

        let mut headers = upgrade_headers(SAMPLE_KEY);
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        assert_eq!(validate(&headers), Err(HandshakeError::MissingConnectionUpgrade));

        let mut headers = upgrade_headers(SAMPLE_KEY);
        headers.remove(header::SEC_WEBSOCKET_KEY);
        assert_eq!(validate(&headers), Err(HandshakeError::MissingKey));

        assert_eq!(validate(&upgrade_headers("   ")), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_malformed_keys() {
        assert!(matches!(
            validate(&upgrade_headers("not base64!")),
            Err(HandshakeError::MalformedKey(_))
        ));
        // Valid base64, but only 5 bytes.
        assert!(matches!(
            validate(&upgrade_headers("aGVsbG8=")),
            Err(HandshakeError::MalformedKey(_))
        ));
    }

    #[test]
    fn test_upgrade_intent() {
        assert!(upgrade_intent(&HeaderMap::new()).is_none());

        let mut partial = upgrade_headers(SAMPLE_KEY);
        partial.remove(header::CONNECTION);
        assert!(upgrade_intent(&partial).is_none());

        assert!(matches!(upgrade_intent(&upgrade_headers(SAMPLE_KEY)), Some(Ok(_))));
        assert!(matches!(
            upgrade_intent(&upgrade_headers("aGVsbG8=")),
            Some(Err(HandshakeError::MalformedKey(_)))
        ));
    }

    #[test]
    fn test_apply_upgrade_rewrites_response() {
        let mut response = http::Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, "5")
            .header("x-session", "abc")
            .body(Bytes::from_static(b"hello"))
            .unwrap();

        let key = HandshakeKey::parse(SAMPLE_KEY).unwrap();
        apply_upgrade(&mut response, &key);

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::UPGRADE], "websocket");
        assert_eq!(response.headers()[header::CONNECTION], "Upgrade");
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_ACCEPT], SAMPLE_ACCEPT);
        assert_eq!(response.headers()["x-session"], "abc");
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(response.body().is_empty());
    }
}
