//! Fragment reassembly (RFC 6455 Section 5.4).
//!
//! A fragmented message is a first fragment (FIN=0, Text or Binary), zero or
//! more continuation fragments (FIN=0, opcode 0x0) and a final fragment
//! (FIN=1, opcode 0x0). Control frames may be interleaved between fragments
//! and never disturb the message being assembled.

use std::fmt;

use crate::close::{is_valid_wire_code, parse_close_payload};
use crate::error::ReassemblyError;
use crate::frame::{Frame, Opcode};

/// Default ceiling on a reassembled message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

impl MessageKind {
    fn from_opcode(opcode: Opcode) -> Option<MessageKind> {
        match opcode {
            Opcode::Text => Some(MessageKind::Text),
            Opcode::Binary => Some(MessageKind::Binary),
            _ => None,
        }
    }
}

/// A complete application message with the masks removed.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub data: Vec<u8>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Message {
        Message {
            kind: MessageKind::Text,
            data: text.into().into_bytes(),
        }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Message {
        Message {
            kind: MessageKind::Binary,
            data: data.into(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    /// The payload as `&str` for text messages. Text is validated on
    /// completion, so this only returns `None` for binary messages.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.data).ok(),
            MessageKind::Binary => None,
        }
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.debug_tuple("Text").field(&text).finish(),
            None => f.debug_tuple("Binary").field(&self.data.len()).finish(),
        }
    }
}

/// What one decoded frame amounts to once it has passed through the
/// reassembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Message),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Per-connection reassembly state. At most one message is buffered.
#[derive(Debug)]
pub struct Reassembler {
    /// Kind of the first fragment. `None` = not in a fragment sequence.
    kind: Option<MessageKind>,
    buffer: Vec<u8>,
    fragments: usize,
    max_message_size: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Reassembler {
            kind: None,
            buffer: Vec::new(),
            fragments: 0,
            max_message_size,
        }
    }

    pub fn is_assembling(&self) -> bool {
        self.kind.is_some()
    }

    /// Number of fragments buffered for the message in progress.
    pub fn fragments(&self) -> usize {
        self.fragments
    }

    /// Drop any partially assembled message.
    pub fn reset(&mut self) {
        self.kind = None;
        self.buffer = Vec::new();
        self.fragments = 0;
    }

    /// Feed one frame in arrival order.
    ///
    /// Returns `Ok(None)` while a fragmented message is still accumulating.
    /// Any error leaves the reassembler reset; the caller is expected to close
    /// the connection with [`ReassemblyError::close_code`].
    pub fn push(&mut self, frame: Frame) -> Result<Option<Event>, ReassemblyError> {
        let fin = frame.fin;
        let opcode = frame.opcode;
        let payload = frame.into_unmasked_payload();

        let result = match opcode {
            Opcode::Ping => Ok(Some(Event::Ping(payload))),
            Opcode::Pong => Ok(Some(Event::Pong(payload))),
            Opcode::Close => close_event(&payload),
            Opcode::Text | Opcode::Binary => self.start(opcode, payload, fin),
            Opcode::Continuation => self.continue_with(payload, fin),
            Opcode::Reserved(byte) => Err(ReassemblyError::UnsupportedOpcode(byte)),
        };
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn start(
        &mut self,
        opcode: Opcode,
        payload: Vec<u8>,
        fin: bool,
    ) -> Result<Option<Event>, ReassemblyError> {
        if self.is_assembling() {
            return Err(ReassemblyError::InterleavedData);
        }
        let kind = MessageKind::from_opcode(opcode)
            .ok_or(ReassemblyError::UnsupportedOpcode(opcode.as_u8()))?;
        self.check_size(payload.len())?;

        if fin {
            return complete(kind, payload).map(Some);
        }
        self.kind = Some(kind);
        self.buffer = payload;
        self.fragments = 1;
        Ok(None)
    }

    fn continue_with(
        &mut self,
        payload: Vec<u8>,
        fin: bool,
    ) -> Result<Option<Event>, ReassemblyError> {
        let Some(kind) = self.kind else {
            return Err(ReassemblyError::UnexpectedContinuation);
        };
        self.check_size(self.buffer.len() + payload.len())?;
        self.buffer.extend_from_slice(&payload);
        self.fragments += 1;

        if !fin {
            return Ok(None);
        }
        let data = std::mem::take(&mut self.buffer);
        self.kind = None;
        self.fragments = 0;
        complete(kind, data).map(Some)
    }

    fn check_size(&self, len: usize) -> Result<(), ReassemblyError> {
        if len > self.max_message_size {
            return Err(ReassemblyError::MessageTooLarge {
                len,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

fn close_event(payload: &[u8]) -> Result<Option<Event>, ReassemblyError> {
    if payload.len() == 1 {
        return Err(ReassemblyError::TruncatedClose);
    }
    let (code, reason) = parse_close_payload(payload);
    // An empty payload parses as 1005, which is fine; 1005 in the frame is not.
    if !payload.is_empty() && !is_valid_wire_code(code) {
        return Err(ReassemblyError::InvalidCloseCode(code));
    }
    Ok(Some(Event::Close { code, reason }))
}

// UTF-8 is checked on the whole message, since a multi-byte character may be
// split across fragments.
fn complete(kind: MessageKind, data: Vec<u8>) -> Result<Event, ReassemblyError> {
    if kind == MessageKind::Text && std::str::from_utf8(&data).is_err() {
        return Err(ReassemblyError::InvalidUtf8);
    }
    Ok(Event::Message(Message { kind, data }))
}
