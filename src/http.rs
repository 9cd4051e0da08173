//! Minimal HTTP/1.x head handling.
//!
//! The front door never speaks full HTTP: the plaintext side only needs the
//! request line and the Host line to issue a redirect, and the terminator
//! only needs the decoded head (plus a small buffered body) to hand a
//! request to the dispatcher. Canned responses are assembled at compile
//! time; their bytes are part of the external interface and must not drift.

use const_format::formatcp;

/// Content type carried by every canned response
const CONTENT_TYPE_TEXT: &str = "Content-Type: text/plain";

/// Close marker carried by the plaintext-side responses
const CONNECTION_CLOSED: &str = "Connection: closed";

/// Response sent when a plaintext request cannot be parsed or names an
/// unregistered domain.
pub const RESPONSE_400: &str = formatcp!(
    "HTTP/1.1 400 Bad Request\r\n{}\r\n{}\r\n\r\n\
     Error 400: Unknown domain; Domain incorrectly pointing to this server.",
    CONTENT_TYPE_TEXT,
    CONNECTION_CLOSED
);

/// Response written by the dispatcher when no handler answers within the
/// timeout window.
pub const RESPONSE_500: &str = formatcp!(
    "HTTP/1.1 500 Internal Server Error\r\n{}\r\n\r\n\
     Error 500: No request handler.",
    CONTENT_TYPE_TEXT
);

/// Build the permanent-redirect response pointing a plaintext request at
/// its HTTPS equivalent.
pub fn response_308(host: &str, path: &str) -> String {
    format!(
        "HTTP/1.1 308 Permanent Redirect\r\n{}\r\n\
         Location: https://{}{}\r\n{}\r\n\r\n\
         Response 308: Redirecting to secured request.",
        CONTENT_TYPE_TEXT, host, path, CONNECTION_CLOSED
    )
}

/// First line of a request plus the Host value from the assumed second
/// line, as used by the plaintext redirect path.
#[derive(Debug, PartialEq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    pub host: String,
}

/// Parse the redirect-relevant prefix of a plaintext request.
///
/// Only the first two lines are consulted: the request line (method and
/// path) and a second line assumed to carry `Host:`. Returns `None` when
/// fewer than two lines are present or either line is malformed.
pub fn parse_request_line(chunk: &[u8]) -> Option<RequestLine> {
    let text = String::from_utf8_lossy(chunk);
    let mut lines = text.lines();

    let request = lines.next()?;
    let host_line = lines.next()?;

    let mut parts = request.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let host = strip_host_prefix(host_line)?.to_string();

    Some(RequestLine { method, path, host })
}

/// Strip a `Host:` header-name prefix (any case), returning the trimmed value.
fn strip_host_prefix(line: &str) -> Option<&str> {
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("host") {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some(value)
}

/// A decoded HTTPS request handed to dispatch subscribers.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Headers in wire order, names as received
    pub headers: Vec<(String, String)>,
    /// The Host header value, used as the dispatch key
    pub host: String,
    /// Body bytes buffered up to the configured cap
    pub body: Vec<u8>,
}

impl Request {
    /// First header value matching `name`, ASCII case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse a full request head (request line through the blank line).
///
/// `head` must not include the terminating blank line's trailing bytes;
/// callers split on `\r\n\r\n` first. Returns `None` on a malformed
/// request line or header line.
pub fn parse_request_head(head: &[u8]) -> Option<Request> {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.lines();

    let request = lines.next()?;
    let mut parts = request.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let host = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    Some(Request {
        method,
        path,
        headers,
        host,
        body: Vec::new(),
    })
}
