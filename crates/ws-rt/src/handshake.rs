//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4.2).
//!
//! Reads the client's HTTP upgrade request, extracts the WebSocket headers,
//! computes the `Sec-WebSocket-Accept` value and writes the `101` response
//! (or `400 Bad Request` on failure).
//!
//! - [`perform_upgrade`]: Main entry point -- reads the request, parses it, writes the response
//! - [`read_request`]: Reads request lines up to the blank line, keeping any bytes after it
//! - [`parse_request`]: Extracts key, version, protocols and extensions from request lines
//! - [`compute_accept_key`]: SHA-1 + Base64 computation per RFC 6455 Section 4.2.2
//! - [`upgrade_response`]: The byte-exact `101` response
//! - [`bad_request_response`]: The `400 Bad Request` response

use std::io::{self, ErrorKind, Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

// Header prefixes are matched case-sensitively, exactly as written here.
const KEY_PREFIX: &str = "Sec-WebSocket-Key:";
const VERSION_PREFIX: &str = "Sec-WebSocket-Version:";
const PROTOCOL_PREFIX: &str = "Sec-WebSocket-Protocol:";
const EXTENSIONS_PREFIX: &str = "Sec-WebSocket-Extensions:";

const READ_CHUNK: usize = 1024;

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64 encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    BASE64.encode(hash)
}

/// The parts of an upgrade request the server records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// e.g. `GET /chat HTTP/1.1`
    pub request_line: String,
    pub key: String,
    pub version: Option<String>,
    /// Requested subprotocols. Recorded, never echoed back.
    pub protocols: Vec<String>,
    /// Requested extensions. Recorded, never honored.
    pub extensions: Vec<String>,
}

impl HandshakeRequest {
    pub fn accept_key(&self) -> String {
        compute_accept_key(&self.key)
    }
}

/// Parse request lines (request line first, no terminating blank line
/// required).
pub fn parse_request<S: AsRef<str>>(lines: &[S]) -> Result<HandshakeRequest, HandshakeError> {
    let mut lines = lines.iter().map(|l| l.as_ref().trim_end_matches('\r'));
    let request_line = match lines.next() {
        Some(line) if !line.trim().is_empty() => line.trim().to_string(),
        _ => return Err(HandshakeError::EmptyRequest),
    };

    let mut key = None;
    let mut version = None;
    let mut protocols = Vec::new();
    let mut extensions = Vec::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix(KEY_PREFIX) {
            key = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix(VERSION_PREFIX) {
            version = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix(PROTOCOL_PREFIX) {
            protocols.extend(split_list(value));
        } else if let Some(value) = line.strip_prefix(EXTENSIONS_PREFIX) {
            extensions.extend(split_list(value));
        }
    }

    let key = key
        .filter(|k| !k.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(HandshakeRequest {
        request_line,
        key,
        version,
        protocols,
        extensions,
    })
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The `101` response, byte for byte.
pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key
    )
}

/// A `400 Bad Request` response with the given reason as its body.
pub fn bad_request_response(reason: &str) -> String {
    let body = format!("Bad Request: {}", reason);
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
}

/// Read an HTTP request head from `reader`.
///
/// Returns the request lines (without line terminators or the final blank
/// line) and every byte that arrived after the blank line. A client is allowed
/// to pipeline its first frame behind the request, so those bytes belong to
/// the connection's receive buffer.
pub fn read_request<R: Read>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<(Vec<String>, Vec<u8>), HandshakeError> {
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut scanned = 0;

    loop {
        if let Some((head_end, body_start)) = find_head_end(&buf, scanned) {
            let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| HandshakeError::InvalidUtf8)?;
            let lines = head
                .split('\n')
                .map(|l| l.trim_end_matches('\r').to_string())
                .collect();
            let leftover = buf[body_start..].to_vec();
            return Ok((lines, leftover));
        }
        if buf.len() >= max_bytes {
            return Err(HandshakeError::TooLarge(max_bytes));
        }
        // Re-scan the last few bytes in case a terminator straddles reads.
        scanned = buf.len().saturating_sub(3);

        let want = READ_CHUNK.min(max_bytes - buf.len());
        match reader.read(&mut chunk[..want]) {
            Ok(0) => return Err(HandshakeError::UnexpectedEof),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(HandshakeError::Timeout)
            }
            Err(e) => return Err(HandshakeError::Io(e)),
        }
    }
}

/// Find the blank line ending the head. Returns (end of last header line,
/// start of body). Accepts bare `\n\n` from lenient clients.
fn find_head_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf[i + 1..].starts_with(b"\r\n") {
                return Some((i, i + 3));
            }
            if buf[i + 1..].starts_with(b"\n") {
                return Some((i, i + 2));
            }
        }
        i += 1;
    }
    None
}

/// A completed upgrade.
#[derive(Debug)]
pub struct Upgrade {
    pub request: HandshakeRequest,
    pub accept_key: String,
    /// Bytes received after the request head; the start of the frame stream.
    pub leftover: Vec<u8>,
}

/// Perform the WebSocket upgrade handshake on a raw stream.
///
/// Reads and parses the request, then writes either the `101` response or a
/// best-effort `400 Bad Request`. Timeouts and disconnects get no response.
/// After a successful upgrade the stream is ready for frame I/O, starting
/// with [`Upgrade::leftover`].
pub fn perform_upgrade<S: Read + Write>(
    stream: &mut S,
    max_bytes: usize,
) -> Result<Upgrade, HandshakeError> {
    let parsed = read_request(stream, max_bytes).and_then(|(lines, leftover)| {
        parse_request(&lines).map(|request| (request, leftover))
    });

    match parsed {
        Ok((request, leftover)) => {
            let accept_key = request.accept_key();
            write_response(stream, &upgrade_response(&accept_key)).map_err(HandshakeError::Io)?;
            Ok(Upgrade {
                request,
                accept_key,
                leftover,
            })
        }
        Err(
            e @ (HandshakeError::MissingKey
            | HandshakeError::EmptyRequest
            | HandshakeError::InvalidUtf8
            | HandshakeError::TooLarge(_)),
        ) => {
            let _ = write_response(stream, &bad_request_response(&e.to_string()));
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn write_response<W: Write>(stream: &mut W, response: &str) -> io::Result<()> {
    stream.write_all(response.as_bytes())?;
    stream.flush()
}
