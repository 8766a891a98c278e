//! WebSocket frame codec (RFC 6455 Section 5.2).
//!
//! Frames are the smallest unit of WebSocket communication. The decoder is a
//! pure function over a byte buffer so it can be driven incrementally by a
//! connection's receive buffer (or by tests) without a socket:
//!
//! - [`decode`]: Parse one frame from the front of a buffer, or report that
//!   more bytes are needed
//! - [`decode_at`]: Same, starting at a cursor into the buffer
//! - [`decode_with_limit`]: Same, rejecting payloads above a size ceiling
//! - [`encode`]: Build an unmasked server frame
//! - [`encode_into`]: Write an unmasked server frame to a stream
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use std::io::{self, Write};

use crate::error::FrameError;
use crate::mask::apply_mask;

/// Control frames carry at most 125 payload bytes (RFC 6455 Section 5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest length representable on the wire (the 64-bit MSB must be clear).
pub const MAX_WIRE_PAYLOAD: u64 = u64::MAX >> 1;

/// WebSocket frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Unassigned opcodes 0x3-0x7 and 0xB-0xF.
    Reserved(u8),
}

impl Opcode {
    /// Parse the low 4 bits of the first header byte.
    pub fn from_u8(byte: u8) -> Opcode {
        match byte & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(b) => b & 0x0F,
        }
    }

    /// Close, Ping, Pong and the reserved control range 0xB-0xF.
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Opcode::Reserved(_))
    }
}

/// One wire-level frame as it arrived, payload still masked if `masked`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload_length: u64,
    pub masking_key: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build an unmasked frame, as a server would send it.
    pub fn new(opcode: Opcode, payload: Vec<u8>, fin: bool) -> Frame {
        Frame {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            payload_length: payload.len() as u64,
            masking_key: None,
            payload,
        }
    }

    /// Build a masked frame, as a client would send it.
    pub fn masked(opcode: Opcode, payload: &[u8], fin: bool, key: [u8; 4]) -> Frame {
        let mut payload = payload.to_vec();
        apply_mask(&mut payload, &key);
        Frame {
            masked: true,
            masking_key: Some(key),
            ..Frame::new(opcode, payload, fin)
        }
    }

    /// The application bytes with the mask removed.
    pub fn unmasked_payload(&self) -> Vec<u8> {
        self.clone().into_unmasked_payload()
    }

    pub fn into_unmasked_payload(self) -> Vec<u8> {
        let mut payload = self.payload;
        if let Some(key) = self.masking_key {
            apply_mask(&mut payload, &key);
        }
        payload
    }

    /// Serialize the frame exactly as described, mask included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(header_len(self.payload.len(), self.masked) + self.payload.len());
        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= 0x80;
        }
        if self.rsv1 {
            byte0 |= 0x40;
        }
        if self.rsv2 {
            byte0 |= 0x20;
        }
        if self.rsv3 {
            byte0 |= 0x10;
        }
        out.push(byte0);
        push_length(&mut out, self.payload.len(), self.masked);
        if let Some(key) = self.masking_key {
            out.extend_from_slice(&key);
        }
        out.extend_from_slice(&self.payload);
        out
    }
}

fn header_len(payload_len: usize, masked: bool) -> usize {
    let len_bytes = match payload_len {
        0..=125 => 0,
        126..=0xFFFF => 2,
        _ => 8,
    };
    2 + len_bytes + if masked { 4 } else { 0 }
}

fn push_length(out: &mut Vec<u8>, len: usize, masked: bool) {
    let mask_bit = if masked { 0x80 } else { 0x00 };
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame; nothing
/// is consumed and the caller retries once more bytes arrive. On success the
/// frame is returned with the exact number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    decode_with_limit(buf, MAX_WIRE_PAYLOAD)
}

/// Decode one frame starting at `offset` into `buf`.
///
/// The consumed count is relative to `offset`.
pub fn decode_at(buf: &[u8], offset: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    decode(buf.get(offset..).unwrap_or(&[]))
}

/// Decode one frame, rejecting any payload longer than `max_payload`.
///
/// The ceiling is checked as soon as the length field is readable, so an
/// oversized frame is refused without waiting for its payload.
pub fn decode_with_limit(
    buf: &[u8],
    max_payload: u64,
) -> Result<Option<(Frame, usize)>, FrameError> {
    // Byte 0: FIN(1) RSV(3) Opcode(4)
    // Byte 1: MASK(1) Payload-Length(7)
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & 0x80 != 0;
    let rsv1 = buf[0] & 0x40 != 0;
    let rsv2 = buf[0] & 0x20 != 0;
    let rsv3 = buf[0] & 0x10 != 0;
    if rsv1 || rsv2 || rsv3 {
        return Err(FrameError::ReservedBits);
    }

    let opcode = Opcode::from_u8(buf[0]);
    if let Opcode::Reserved(byte) = opcode {
        return Err(FrameError::ReservedOpcode(byte));
    }
    if opcode.is_control() && !fin {
        return Err(FrameError::FragmentedControl);
    }

    let masked = buf[1] & 0x80 != 0;
    let length_byte = buf[1] & 0x7F;
    let mut offset = 2;

    let payload_length: u64 = match length_byte {
        0..=125 => u64::from(length_byte),
        126 => {
            if buf.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]);
            offset += 2;
            u64::from(len)
        }
        _ => {
            if buf.len() < offset + 8 {
                return Ok(None);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(bytes);
            if len >> 63 != 0 {
                return Err(FrameError::LengthMsbSet);
            }
            offset += 8;
            len
        }
    };

    if opcode.is_control() && payload_length > MAX_CONTROL_PAYLOAD as u64 {
        return Err(FrameError::ControlTooLong(payload_length));
    }
    if payload_length > max_payload {
        return Err(FrameError::TooLarge {
            len: payload_length,
            max: max_payload,
        });
    }
    let payload_len = usize::try_from(payload_length).map_err(|_| FrameError::TooLarge {
        len: payload_length,
        max: usize::MAX as u64,
    })?;

    let masking_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total = match offset.checked_add(payload_len) {
        Some(total) => total,
        None => {
            return Err(FrameError::TooLarge {
                len: payload_length,
                max: max_payload,
            })
        }
    };
    if buf.len() < total {
        return Ok(None);
    }

    let frame = Frame {
        fin,
        rsv1,
        rsv2,
        rsv3,
        opcode,
        masked,
        payload_length,
        masking_key,
        payload: buf[offset..total].to_vec(),
    };
    Ok(Some((frame, total)))
}

/// Encode an unmasked server-to-client frame.
///
/// Servers MUST NOT mask (RFC 6455 Section 5.1). The shortest of the three
/// length encodings that fits the payload is used.
pub fn encode(opcode: Opcode, payload: &[u8], fin: bool) -> Vec<u8> {
    let fin_bit: u8 = if fin { 0x80 } else { 0x00 };
    let byte0 = fin_bit | opcode.as_u8();
    let mut out = Vec::with_capacity(header_len(payload.len(), false) + payload.len());
    out.push(byte0);
    push_length(&mut out, payload.len(), false);
    out.extend_from_slice(payload);
    out
}

/// Write one unmasked frame to `writer` and flush it.
///
/// The frame is written with a single `write_all` so that a writer guarded by
/// a lock never interleaves two frames.
pub fn encode_into<W: Write>(
    writer: &mut W,
    opcode: Opcode,
    payload: &[u8],
    fin: bool,
) -> io::Result<()> {
    writer.write_all(&encode(opcode, payload, fin))?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_one(bytes: &[u8]) -> (Frame, usize) {
        decode(bytes).unwrap().expect("complete frame")
    }

    #[test]
    fn test_read_7bit_text_frame() {
        // FIN=1, opcode=Text, MASK=1, len=2, zero mask key, payload "Hi"
        let frame_bytes = vec![0x81, 0x82, 0, 0, 0, 0, b'H', b'i'];
        let (frame, used) = decode_one(&frame_bytes);
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert!(frame.masked);
        assert_eq!(frame.masking_key, Some([0, 0, 0, 0]));
        assert_eq!(frame.payload_length, 2);
        assert_eq!(frame.into_unmasked_payload(), b"Hi");
        assert_eq!(used, 8);
    }

    #[test]
    fn test_read_masked_payload_stays_masked() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let bytes = Frame::masked(Opcode::Text, b"Hello", true, key).to_bytes();
        assert_eq!(
            bytes,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
        let (frame, _) = decode_one(&bytes);
        assert_eq!(frame.payload, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        assert_eq!(frame.unmasked_payload(), b"Hello");
    }

    #[test]
    fn test_read_16bit_length() {
        let payload = vec![0xABu8; 200];
        let mut frame_bytes = vec![0x82, 0xFE];
        frame_bytes.extend_from_slice(&200u16.to_be_bytes());
        frame_bytes.extend_from_slice(&[0u8; 4]);
        frame_bytes.extend_from_slice(&payload);

        let (frame, used) = decode_one(&frame_bytes);
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload_length, 200);
        assert_eq!(frame.into_unmasked_payload(), payload);
        assert_eq!(used, 2 + 2 + 4 + 200);
    }

    #[test]
    fn test_read_64bit_length() {
        let payload = vec![0xCDu8; 300];
        let mut frame_bytes = vec![0x82, 0xFF];
        frame_bytes.extend_from_slice(&300u64.to_be_bytes());
        frame_bytes.extend_from_slice(&[0u8; 4]);
        frame_bytes.extend_from_slice(&payload);

        let (frame, used) = decode_one(&frame_bytes);
        assert_eq!(frame.payload_length, 300);
        assert_eq!(frame.into_unmasked_payload(), payload);
        assert_eq!(used, 2 + 8 + 4 + 300);
    }

    #[test]
    fn test_read_unmasked_frame() {
        let (frame, used) = decode_one(&[0x81, 0x02, b'o', b'k']);
        assert!(!frame.masked);
        assert_eq!(frame.masking_key, None);
        assert_eq!(frame.into_unmasked_payload(), b"ok");
        assert_eq!(used, 4);
    }

    #[test]
    fn test_write_small_frame() {
        let buf = encode(Opcode::Text, b"Hello", true);
        assert_eq!(buf, vec![0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_write_medium_frame() {
        let payload = vec![0x42u8; 200];
        let buf = encode(Opcode::Binary, &payload, true);
        assert_eq!(buf[0], 0x82);
        assert_eq!(buf[1], 126);
        assert_eq!(&buf[2..4], &200u16.to_be_bytes());
        assert_eq!(&buf[4..], &payload[..]);
    }

    #[test]
    fn test_write_large_frame() {
        let payload = vec![0x11u8; 70_000];
        let buf = encode(Opcode::Binary, &payload, true);
        assert_eq!(buf[1], 127);
        assert_eq!(&buf[2..10], &70_000u64.to_be_bytes());
        assert_eq!(buf.len(), 10 + 70_000);
    }

    #[test]
    fn test_write_length_boundaries() {
        assert_eq!(encode(Opcode::Text, &[0; 125], true)[1], 125);
        assert_eq!(encode(Opcode::Text, &[0; 126], true)[1], 126);
        assert_eq!(encode(Opcode::Text, &[0; 65_535], true)[1], 126);
        assert_eq!(encode(Opcode::Text, &[0; 65_536], true)[1], 127);
    }

    #[test]
    fn test_write_non_final_frame() {
        let buf = encode(Opcode::Text, b"He", false);
        assert_eq!(buf, vec![0x01, 0x02, b'H', b'e']);
    }

    #[test]
    fn test_encode_into_writer() {
        let mut out = Vec::new();
        encode_into(&mut out, Opcode::Pong, b"abc", true).unwrap();
        assert_eq!(out, vec![0x8A, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_unknown_opcode() {
        let result = decode(&[0x83, 0x00]);
        assert_eq!(result, Err(FrameError::ReservedOpcode(0x3)));
        let result = decode(&[0x8B, 0x00]);
        assert_eq!(result, Err(FrameError::ReservedOpcode(0xB)));
    }

    #[test]
    fn test_nonzero_rsv_rejected() {
        // FIN=1, RSV1=1, opcode=Text
        assert_eq!(decode(&[0xC1, 0x00]), Err(FrameError::ReservedBits));
        // RSV2 and RSV3 alone
        assert_eq!(decode(&[0xA1, 0x00]), Err(FrameError::ReservedBits));
        assert_eq!(decode(&[0x91, 0x00]), Err(FrameError::ReservedBits));
    }

    #[test]
    fn test_fragmented_control_rejected() {
        // FIN=0, opcode=Ping
        assert_eq!(decode(&[0x09, 0x00]), Err(FrameError::FragmentedControl));
    }

    #[test]
    fn test_long_control_rejected() {
        // Close with a 16-bit length of 126
        let bytes = [0x88, 0x7E, 0x00, 0x7E];
        assert_eq!(decode(&bytes), Err(FrameError::ControlTooLong(126)));
    }

    #[test]
    fn test_64bit_msb_rejected() {
        let mut bytes = vec![0x82, 0x7F];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert_eq!(decode(&bytes), Err(FrameError::LengthMsbSet));
    }

    #[test]
    fn test_limit_rejects_before_payload_arrives() {
        let mut bytes = vec![0x82, 0x7E];
        bytes.extend_from_slice(&1000u16.to_be_bytes());
        // Only the header is present; the ceiling still applies.
        assert_eq!(
            decode_with_limit(&bytes, 512),
            Err(FrameError::TooLarge { len: 1000, max: 512 })
        );
    }

    #[test]
    fn test_incomplete_header_and_payload() {
        assert_eq!(decode(&[]), Ok(None));
        assert_eq!(decode(&[0x81]), Ok(None));
        // 16-bit length not yet complete
        assert_eq!(decode(&[0x82, 0x7E, 0x00]), Ok(None));
        // Mask key incomplete
        assert_eq!(decode(&[0x81, 0x85, 0x01, 0x02]), Ok(None));
        // Payload short by one byte
        assert_eq!(decode(&[0x81, 0x03, b'a', b'b']), Ok(None));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut bytes = encode(Opcode::Text, b"one", true);
        bytes.extend(encode(Opcode::Text, b"two", true));

        let (first, used) = decode_one(&bytes);
        assert_eq!(first.payload, b"one");
        let (second, used2) = decode_at(&bytes, used).unwrap().unwrap();
        assert_eq!(second.payload, b"two");
        assert_eq!(used + used2, bytes.len());
        assert_eq!(decode_at(&bytes, bytes.len()), Ok(None));
        assert_eq!(decode_at(&bytes, bytes.len() + 5), Ok(None));
    }

    #[test]
    fn test_frame_roundtrip() {
        let original_payload = b"round-trip test payload";
        let buf = encode(Opcode::Text, original_payload, true);
        let (frame, used) = decode_one(&buf);
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, original_payload);
        assert_eq!(used, buf.len());
    }

    #[test]
    fn test_opcode_classification() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(Opcode::Reserved(0xC).is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
        assert!(Opcode::Reserved(0x5).is_reserved());
        assert_eq!(Opcode::from_u8(0x8A), Opcode::Pong);
    }

    proptest! {
        #[test]
        fn byte_at_a_time_yields_exactly_one_frame(
            payload in proptest::collection::vec(any::<u8>(), 0..70_000usize),
            key in any::<[u8; 4]>(),
            binary in any::<bool>(),
        ) {
            let opcode = if binary { Opcode::Binary } else { Opcode::Text };
            let bytes = Frame::masked(opcode, &payload, true, key).to_bytes();

            // Every strict prefix is incomplete; the full buffer is one frame.
            let header = bytes.len() - payload.len();
            for end in 0..header {
                prop_assert_eq!(decode(&bytes[..end]), Ok(None));
            }
            for end in [header, header + payload.len() / 2, bytes.len() - 1] {
                if end < bytes.len() {
                    prop_assert_eq!(decode(&bytes[..end]), Ok(None));
                }
            }
            let (frame, used) = decode(&bytes).unwrap().unwrap();
            prop_assert_eq!(used, bytes.len());
            prop_assert_eq!(frame.opcode, opcode);
            prop_assert_eq!(frame.into_unmasked_payload(), payload);
        }

        #[test]
        fn every_prefix_of_a_small_frame_is_incomplete(
            payload in proptest::collection::vec(any::<u8>(), 0..300usize),
            key in any::<[u8; 4]>(),
        ) {
            let bytes = Frame::masked(Opcode::Text, &payload, true, key).to_bytes();
            for end in 0..bytes.len() {
                prop_assert_eq!(decode(&bytes[..end]), Ok(None));
            }
            prop_assert!(decode(&bytes).unwrap().is_some());
        }

        #[test]
        fn rsv1_always_rejected(
            payload in proptest::collection::vec(any::<u8>(), 0..200usize),
            opcode in prop_oneof![Just(Opcode::Text), Just(Opcode::Binary), Just(Opcode::Continuation), Just(Opcode::Ping)],
            masked in any::<bool>(),
        ) {
            let mut frame = if masked {
                Frame::masked(opcode, &payload, true, [1, 2, 3, 4])
            } else {
                Frame::new(opcode, payload.clone(), true)
            };
            frame.rsv1 = true;
            prop_assert_eq!(decode(&frame.to_bytes()), Err(FrameError::ReservedBits));
        }
    }
}
