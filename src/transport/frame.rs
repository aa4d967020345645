//! Frame encoding and decoding.
//!
//! Stream wire format (length covers type, flags and body):
//! ```text
//! +----------------+--------+--------+---------------------+
//! | Length         | Type   | Flags  | Body                |
//! | 4 bytes (BE32) | 1 byte | 1 byte | Length - 2 bytes    |
//! +----------------+--------+--------+---------------------+
//! ```
//!
//! Datagram wire format: the same without the length prefix; the datagram
//! boundary is the frame boundary.

use thiserror::Error;

use crate::core::{FRAME_HEADER_SIZE, LENGTH_PREFIX_SIZE};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// First handshake message (initiator to responder).
    HandshakeInit = 0x01,
    /// Second handshake message (responder to initiator).
    HandshakeResp = 0x02,
    /// Application payload.
    Data = 0x03,
    /// Idle keep-alive; carries no payload and is never delivered.
    KeepAlive = 0x04,
}

impl FrameType {
    /// Parse frame type from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::HandshakeInit),
            0x02 => Some(Self::HandshakeResp),
            0x03 => Some(Self::Data),
            0x04 => Some(Self::KeepAlive),
            _ => None,
        }
    }

    /// Convert frame type to its byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Frame flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Last message the sender will emit on this connection.
    pub const FINAL: Self = Self(0x01);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if FINAL flag is set.
    pub fn is_final(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Set FINAL flag.
    pub fn with_final(self) -> Self {
        Self(self.0 | 0x01)
    }

    /// Reserved bits must be zero.
    pub fn is_valid(self) -> bool {
        self.0 & 0xFE == 0
    }
}

/// Frame parsing errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the header requires.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Expected minimum size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Unknown frame type byte.
    #[error("invalid frame type: 0x{0:02x}")]
    InvalidType(u8),

    /// Reserved flag bits set.
    #[error("invalid frame flags: 0x{0:02x}")]
    InvalidFlags(u8),

    /// Announced frame exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    TooLarge {
        /// Announced size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A valid frame type arrived where the protocol does not allow it.
    #[error("unexpected {0:?} frame")]
    Unexpected(FrameType),
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Body: plaintext payload, handshake message or sealed record.
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a frame.
    pub fn new(frame_type: FrameType, flags: FrameFlags, body: Vec<u8>) -> Self {
        Self {
            frame_type,
            flags,
            body,
        }
    }

    /// Create a data frame, optionally marked final.
    pub fn data(payload: Vec<u8>, is_final: bool) -> Self {
        let flags = if is_final {
            FrameFlags::NONE.with_final()
        } else {
            FrameFlags::NONE
        };
        Self::new(FrameType::Data, flags, payload)
    }

    /// Create a keep-alive frame.
    pub fn keep_alive() -> Self {
        Self::new(FrameType::KeepAlive, FrameFlags::NONE, Vec::new())
    }

    /// Whether the sender marked this as its last message.
    pub fn is_final(&self) -> bool {
        self.flags.is_final()
    }

    /// Size on the wire without the stream length prefix.
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }

    /// Encode with the 4-byte big-endian length prefix.
    pub fn encode_stream(&self) -> Vec<u8> {
        let len = self.wire_size() as u32;
        let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + self.wire_size());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.push(self.frame_type.as_byte());
        buf.push(self.flags.as_byte());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Encode as a single datagram.
    pub fn encode_datagram(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_size());
        buf.push(self.frame_type.as_byte());
        buf.push(self.flags.as_byte());
        buf.extend_from_slice(&self.body);
        buf
    }

    /// Decode a single datagram.
    pub fn decode_datagram(data: &[u8]) -> Result<Self, FrameError> {
        Self::decode_unprefixed(data)
    }

    fn decode_unprefixed(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let frame_type = FrameType::from_byte(data[0]).ok_or(FrameError::InvalidType(data[0]))?;
        let flags = FrameFlags::from_byte(data[1]);
        if !flags.is_valid() {
            return Err(FrameError::InvalidFlags(data[1]));
        }

        Ok(Self {
            frame_type,
            flags,
            body: data[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Reassembles frames from arbitrarily split stream chunks.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder rejecting frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// An oversized length prefix is rejected as soon as it is read, before
    /// the body arrives.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if len < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: len,
            });
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = Frame::decode_unprefixed(&self.buffer[LENGTH_PREFIX_SIZE..total])?;
        self.buffer.drain(..total);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_roundtrip() {
        for ty in [
            FrameType::HandshakeInit,
            FrameType::HandshakeResp,
            FrameType::Data,
            FrameType::KeepAlive,
        ] {
            assert_eq!(FrameType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(FrameType::from_byte(0x7f), None);
    }

    #[test]
    fn test_stream_encoding_layout() {
        let frame = Frame::data(b"hello".to_vec(), false);
        let wire = frame.encode_stream();

        assert_eq!(&wire[..4], &7u32.to_be_bytes());
        assert_eq!(wire[4], FrameType::Data.as_byte());
        assert_eq!(wire[5], 0);
        assert_eq!(&wire[6..], b"hello");
    }

    #[test]
    fn test_decoder_reassembles_split_chunks() {
        let frames = vec![
            Frame::data(b"first".to_vec(), false),
            Frame::data(Vec::new(), false),
            Frame::data(vec![0xAB; 300], false),
            Frame::data(b"bye".to_vec(), true),
        ];
        let wire: Vec<u8> = frames.iter().flat_map(Frame::encode_stream).collect();

        // Feed the stream in awkward chunk sizes.
        for chunk_size in [1, 3, 7, 64, wire.len()] {
            let mut decoder = FrameDecoder::new(1024);
            let mut decoded = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder.push(chunk);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    decoded.push(frame);
                }
            }
            assert_eq!(decoded, frames, "chunk size {chunk_size}");
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_decoder_rejects_oversized_prefix() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&1000u32.to_be_bytes());

        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLarge {
                size: 1000,
                max: 16
            })
        );
    }

    #[test]
    fn test_decoder_waits_for_partial_frame() {
        let wire = Frame::data(b"partial".to_vec(), false).encode_stream();
        let mut decoder = FrameDecoder::new(1024);

        decoder.push(&wire[..6]);
        assert_eq!(decoder.next_frame(), Ok(None));

        decoder.push(&wire[6..]);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.body, b"partial");
    }

    #[test]
    fn test_datagram_roundtrip_preserves_final() {
        let frame = Frame::data(b"pos".to_vec(), true);
        let decoded = Frame::decode_datagram(&frame.encode_datagram()).unwrap();
        assert!(decoded.is_final());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_datagram_rejects_reserved_flags() {
        let bad = [FrameType::Data.as_byte(), 0x80, 1, 2];
        assert_eq!(
            Frame::decode_datagram(&bad),
            Err(FrameError::InvalidFlags(0x80))
        );
    }

    #[test]
    fn test_datagram_too_short() {
        assert!(matches!(
            Frame::decode_datagram(&[0x03]),
            Err(FrameError::TooShort { .. })
        ));
    }
}
