//! HTTP upgrade handshake (RFC 6455 §4.2).
//!
//! The request head is read and parsed by hand; only what the handshake needs
//! is kept. A rejected handshake never gets an HTTP response: the caller
//! drops the connection and logs the [`HandshakeError`] variant.

use base64::Engine;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default cap on the size of an HTTP request head.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 8 * 1024;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("request is not a websocket upgrade")]
    NotUpgrade,

    #[error("upgrade requested for unknown path: {0}")]
    WrongPath(String),

    #[error("upgrade must use GET, got {0}")]
    MethodNotAllowed(String),

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("invalid Sec-WebSocket-Key: {0}")]
    InvalidKey(String),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("malformed request head: {0}")]
    Malformed(&'static str),

    #[error("connection closed before request head completed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed HTTP request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parse a request head (everything up to and including the blank line).
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(raw).map_err(|_| HandshakeError::Malformed("not utf-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(HandshakeError::Malformed("empty request"))?;
        let mut parts = request_line.split(' ');
        let method = parts.next().filter(|s| !s.is_empty());
        let target = parts.next().filter(|s| !s.is_empty());
        let version = parts.next().filter(|s| s.starts_with("HTTP/"));
        let (Some(method), Some(target), Some(version)) = (method, target, version) else {
            return Err(HandshakeError::Malformed("bad request line"));
        };
        if parts.next().is_some() {
            return Err(HandshakeError::Malformed("bad request line"));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(HandshakeError::Malformed("header without colon"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Request target without its query string.
    pub fn path(&self) -> &str {
        self.target
            .split_once('?')
            .map_or(self.target.as_str(), |(path, _)| path)
    }

    /// Whether the request asks to upgrade to the websocket protocol.
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("websocket")))
            .unwrap_or(false)
    }
}

/// Read from `stream` until the end of the HTTP head.
///
/// Returns the parsed head and the raw bytes that were consumed: the head
/// itself followed by any bytes read past it. Callers that hand the
/// connection to an HTTP server replay the whole buffer; the handshake path
/// feeds `raw[head_len..]` to the frame decoder.
pub async fn read_request_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_head_bytes: usize,
) -> Result<(RequestHead, usize, Bytes), HandshakeError> {
    let mut buf = BytesMut::with_capacity(1024);
    let mut scanned = 0usize;
    loop {
        if let Some(pos) = find_head_end(&buf, scanned) {
            let head_len = pos + 4;
            if head_len > max_head_bytes {
                return Err(HandshakeError::HeadTooLarge(max_head_bytes));
            }
            let head = RequestHead::parse(&buf[..head_len])?;
            return Ok((head, head_len, buf.freeze()));
        }
        if buf.len() >= max_head_bytes {
            return Err(HandshakeError::HeadTooLarge(max_head_bytes));
        }
        scanned = buf.len().saturating_sub(3);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }
    }
}

fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + from)
}

/// Compute the `Sec-WebSocket-Accept` token for a client key.
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response for an accepted upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub accept: String,
}

impl HandshakeResponse {
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            self.accept
        ))
    }
}

/// Validate an upgrade request for `terminal_path` and build the response.
pub fn negotiate(head: &RequestHead, terminal_path: &str) -> Result<HandshakeResponse, HandshakeError> {
    if !head.is_upgrade() {
        return Err(HandshakeError::NotUpgrade);
    }
    if head.path() != terminal_path {
        return Err(HandshakeError::WrongPath(head.path().to_string()));
    }
    if head.method != "GET" {
        return Err(HandshakeError::MethodNotAllowed(head.method.clone()));
    }
    let key = head.header("sec-websocket-key").ok_or(HandshakeError::MissingKey)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| HandshakeError::InvalidKey(key.to_string()))?;
    if decoded.len() != 16 {
        return Err(HandshakeError::InvalidKey(key.to_string()));
    }
    Ok(HandshakeResponse {
        accept: accept_token(key),
    })
}
