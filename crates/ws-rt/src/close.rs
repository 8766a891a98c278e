//! Close handshake payloads (RFC 6455 Section 5.5.1, 7.4).
//!
//! - [`parse_close_payload`]: Extract status code + reason from a close frame payload
//! - [`build_close_payload`]: Build a close frame payload from code + reason
//! - [`close_frame`]: Encode a complete close frame ready for the wire
//! - [`is_valid_wire_code`]: Whether a status code may appear in a close frame
//! - [`reply_code`]: Status code to echo back when the peer starts the close

use crate::frame::{encode, Opcode, MAX_CONTROL_PAYLOAD};

/// Well-known WebSocket close status codes per RFC 6455 Section 7.4.1.
pub struct CloseCode;

impl CloseCode {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;
    /// Going away (1001), sent on server shutdown and idle timeout.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error (1002).
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// No status code was present (1005). Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame (1006). Never sent on the wire.
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload data (1007), used for UTF-8 failure.
    pub const INVALID_DATA: u16 = 1007;
    /// Policy violation (1008).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Message too big (1009).
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Internal server error (1011).
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// Parse a close frame payload into (status_code, reason).
///
/// An empty payload carries no status code and yields `(1005, "")`. A
/// 1-byte payload is malformed; the reassembler rejects it before it gets
/// here. The reason is decoded lossily.
pub fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() >= 2 {
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
        (code, reason)
    } else {
        (CloseCode::NO_STATUS, String::new())
    }
}

/// Build a close frame payload from a status code and reason string.
///
/// The reason is cut at a character boundary so the whole payload stays
/// within the 125-byte control frame limit.
pub fn build_close_payload(code: u16, reason: &str) -> Vec<u8> {
    let max_reason_len = MAX_CONTROL_PAYLOAD - 2;
    let mut end = reason.len().min(max_reason_len);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// Encode an unmasked close frame.
pub fn close_frame(code: u16, reason: &str) -> Vec<u8> {
    encode(Opcode::Close, &build_close_payload(code, reason), true)
}

/// Whether `code` may be sent in a close frame (RFC 6455 Section 7.4).
///
/// 1004, 1005, 1006 and 1015 are reserved, below 1000 is unused and
/// 1016-2999 is left for future protocol revisions.
pub fn is_valid_wire_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// The status code a server echoes when the peer initiates the close.
///
/// A peer close without a status is answered with 1000. A code that may not
/// appear on the wire is answered with 1002.
pub fn reply_code(peer_code: u16) -> u16 {
    match peer_code {
        CloseCode::NO_STATUS => CloseCode::NORMAL,
        code if is_valid_wire_code(code) => code,
        _ => CloseCode::PROTOCOL_ERROR,
    }
}
