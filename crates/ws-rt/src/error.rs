//! Error types for every layer of the runtime.
//!
//! Protocol errors carry the RFC 6455 close code the connection is closed
//! with ([`FrameError::close_code`], [`ReassemblyError::close_code`]).
//! Handshake errors never produce a close code: the connection was never
//! upgraded, so the socket is simply dropped.

use std::io;

use thiserror::Error;

use crate::close::CloseCode;
use crate::connection::ConnectionId;

/// A frame that violates RFC 6455 Section 5.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("non-zero RSV bits without negotiated extensions")]
    ReservedBits,
    #[error("reserved opcode: 0x{0:X}")]
    ReservedOpcode(u8),
    #[error("fragmented control frame")]
    FragmentedControl,
    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(u64),
    #[error("MSB of 64-bit length must be 0")]
    LengthMsbSet,
    #[error("client frame is not masked")]
    Unmasked,
    #[error("payload length {len} exceeds maximum {max}")]
    TooLarge { len: u64, max: u64 },
}

impl FrameError {
    /// Close code sent to the peer before the connection is torn down.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::TooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

/// A frame sequence that cannot be assembled into a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    #[error("unexpected continuation frame")]
    UnexpectedContinuation,
    #[error("new data frame during fragmented message")]
    InterleavedData,
    #[error("unsupported opcode 0x{0:X}")]
    UnsupportedOpcode(u8),
    #[error("message of {len} bytes exceeds maximum {max}")]
    MessageTooLarge { len: usize, max: usize },
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
    #[error("close payload of 1 byte")]
    TruncatedClose,
    #[error("close code {0} is not allowed on the wire")]
    InvalidCloseCode(u16),
}

impl ReassemblyError {
    pub fn close_code(&self) -> u16 {
        match self {
            ReassemblyError::MessageTooLarge { .. } => CloseCode::MESSAGE_TOO_BIG,
            ReassemblyError::InvalidUtf8 => CloseCode::INVALID_DATA,
            _ => CloseCode::PROTOCOL_ERROR,
        }
    }
}

/// Failure to complete the HTTP upgrade.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("empty upgrade request")]
    EmptyRequest,
    #[error("upgrade request is not valid UTF-8")]
    InvalidUtf8,
    #[error("upgrade request exceeds {0} bytes")]
    TooLarge(usize),
    #[error("connection closed before the upgrade request was complete")]
    UnexpectedEof,
    #[error("timed out waiting for the upgrade request")]
    Timeout,
    #[error("handshake i/o: {0}")]
    Io(#[source] io::Error),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum WsError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("no live connection with id {0}")]
    UnknownConnection(ConnectionId),
    #[error("server is already running")]
    AlreadyStarted,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = WsError> = std::result::Result<T, E>;
