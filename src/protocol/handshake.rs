// RFC 6455 opening handshake.
//
// Server side validates the client's Upgrade request under a fixed header
// budget and answers with the exact 101 response; client side emits the
// GET and validates the reply. Bytes read past the header terminator are
// returned to the caller so the frame layer starts with a clean slate.

use crate::error::{Result, WsError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};
use std::time::Duration;

/// Protocol GUID appended to the client key before hashing.
pub const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default cap on total request-head bytes (request line + headers).
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8192;

/// Default per-handshake deadline.
pub const DEFAULT_HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

/// Handshake configuration
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Maximum accepted request-head size in bytes.
    pub max_header_bytes: usize,

    /// Deadline applied to the socket while the handshake runs.
    pub deadline: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            deadline: DEFAULT_HANDSHAKE_DEADLINE,
        }
    }
}

/// Validated fields of a client Upgrade request.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Request-target path, uninterpreted by the core.
    pub path: String,
    /// Raw Sec-WebSocket-Key value.
    pub key: String,
    /// Host header, when present.
    pub host: Option<String>,
    /// Requested subprotocols, in client preference order.
    pub protocols: Vec<String>,
}

/// Compute `Sec-WebSocket-Accept` = base64(SHA1(key || GUID)).
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID);
    BASE64.encode(hasher.finalize())
}

/// Generate a fresh client nonce: 16 random bytes, base64-encoded.
pub fn generate_client_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Case-insensitive check that a comma-separated header value contains
/// `token`.
fn header_contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_head(head: &[u8]) -> Result<(String, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head)
        .map_err(|_| WsError::HandshakeInvalid("request head is not valid UTF-8".into()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| WsError::HandshakeInvalid("empty request".into()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| WsError::HandshakeInvalid(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((request_line, headers))
}

/// Validate a client Upgrade request head (everything before the blank
/// line, excluding it).
pub fn parse_client_request(head: &[u8]) -> Result<HandshakeRequest> {
    let (request_line, headers) = parse_head(head)?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if !method.eq_ignore_ascii_case("GET") {
        return Err(WsError::HandshakeInvalid(format!(
            "method {method} is not GET"
        )));
    }
    if version != "HTTP/1.1" {
        return Err(WsError::HandshakeInvalid(format!(
            "unsupported HTTP version {version}"
        )));
    }

    let upgrade = header_value(&headers, "Upgrade")
        .ok_or_else(|| WsError::HandshakeInvalid("missing Upgrade header".into()))?;
    if !header_contains_token(upgrade, "websocket") {
        return Err(WsError::HandshakeInvalid(
            "Upgrade header does not contain 'websocket'".into(),
        ));
    }

    let connection = header_value(&headers, "Connection")
        .ok_or_else(|| WsError::HandshakeInvalid("missing Connection header".into()))?;
    if !header_contains_token(connection, "Upgrade") {
        return Err(WsError::HandshakeInvalid(
            "Connection header does not contain 'Upgrade'".into(),
        ));
    }

    let version = header_value(&headers, "Sec-WebSocket-Version")
        .ok_or_else(|| WsError::HandshakeInvalid("missing Sec-WebSocket-Version".into()))?;
    if version.trim() != "13" {
        return Err(WsError::HandshakeInvalid(format!(
            "unsupported Sec-WebSocket-Version {version}"
        )));
    }

    let key = header_value(&headers, "Sec-WebSocket-Key")
        .ok_or_else(|| WsError::HandshakeInvalid("missing Sec-WebSocket-Key".into()))?
        .to_string();

    let protocols = header_value(&headers, "Sec-WebSocket-Protocol")
        .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
        .unwrap_or_default();

    Ok(HandshakeRequest {
        path: path.to_string(),
        key,
        host: header_value(&headers, "Host").map(str::to_string),
        protocols,
    })
}

/// Build the exact 101 response for an accepted upgrade.
pub fn build_server_response(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
    )
    .into_bytes()
}

/// Build a client Upgrade request for `path` on `host` with `key`.
pub fn build_client_request(host: &str, path: &str, key: &str) -> Vec<u8> {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
    .into_bytes()
}

/// Validate a server's reply to our Upgrade request.
pub fn parse_server_response(head: &[u8], expected_accept: &str) -> Result<()> {
    let (status_line, headers) = parse_head(head)?;

    let mut parts = status_line.split_whitespace();
    let _version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");
    if status != "101" {
        return Err(WsError::HandshakeInvalid(format!(
            "expected 101, got status {status}"
        )));
    }

    let upgrade = header_value(&headers, "Upgrade").unwrap_or("");
    if !header_contains_token(upgrade, "websocket") {
        return Err(WsError::HandshakeInvalid(
            "response Upgrade header is not 'websocket'".into(),
        ));
    }
    let connection = header_value(&headers, "Connection").unwrap_or("");
    if !header_contains_token(connection, "Upgrade") {
        return Err(WsError::HandshakeInvalid(
            "response Connection header is not 'Upgrade'".into(),
        ));
    }

    let accept = header_value(&headers, "Sec-WebSocket-Accept")
        .ok_or_else(|| WsError::HandshakeInvalid("missing Sec-WebSocket-Accept".into()))?;
    if accept != expected_accept {
        return Err(WsError::HandshakeInvalid(
            "Sec-WebSocket-Accept does not match the sent key".into(),
        ));
    }
    Ok(())
}

/// Read an HTTP head (through `\r\n\r\n`) within `budget` bytes.
///
/// Returns the head (terminator excluded) and any bytes read past it,
/// which belong to the frame layer.
pub fn read_head<S: Read>(stream: &mut S, budget: usize) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).map_err(map_handshake_io)?;
        if n == 0 {
            return Err(WsError::HandshakeInvalid(
                "connection closed before the header terminator".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_terminator(&buf) {
            let leftover = buf.split_off(end + 4);
            buf.truncate(end);
            return Ok((buf, leftover));
        }
        if buf.len() > budget {
            return Err(WsError::HandshakeInvalid(format!(
                "request head exceeds {budget} bytes"
            )));
        }
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn map_handshake_io(e: std::io::Error) -> WsError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => WsError::HandshakeTimeout,
        _ => WsError::TransportIo(e),
    }
}

/// Run the server side of the handshake on a blocking stream whose read
/// timeout reflects the configured deadline. Returns the validated
/// request and any buffered post-head bytes.
pub fn perform_server<S: Read + Write>(
    stream: &mut S,
    config: &HandshakeConfig,
) -> Result<(HandshakeRequest, Vec<u8>)> {
    let (head, leftover) = read_head(stream, config.max_header_bytes)?;
    let request = parse_client_request(&head)?;
    let accept = compute_accept_key(&request.key);
    stream
        .write_all(&build_server_response(&accept))
        .map_err(map_handshake_io)?;
    Ok((request, leftover))
}

/// Run the client side of the handshake. Returns buffered bytes that
/// arrived after the 101 head; they are the first frame bytes.
pub fn perform_client<S: Read + Write>(
    stream: &mut S,
    host: &str,
    path: &str,
    config: &HandshakeConfig,
) -> Result<Vec<u8>> {
    let key = generate_client_key();
    stream
        .write_all(&build_client_request(host, path, &key))
        .map_err(map_handshake_io)?;

    let (head, leftover) = read_head(stream, config.max_header_bytes)?;
    parse_server_response(&head, &compute_accept_key(&key))?;
    Ok(leftover)
}
