//! Sequenced datagram envelope.
//!
//! Wire format (big-endian):
//! ```text
//! +0      Sender ID Length (2 bytes)
//! +2      Sender ID (UTF-8, variable)
//! +2+n    Sequence (4 bytes)
//! +6+n    Timestamp (8 bytes, IEEE 754 f64, seconds since the Unix epoch)
//! +14+n   Payload Length (4 bytes)
//! +18+n   Payload (variable)
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::core::{Classify, ErrorKind};

/// Fixed part of the envelope header (everything but the sender id).
pub const ENVELOPE_HEADER_SIZE: usize = 18;

/// One state update from one sender.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Who sent it.
    pub sender_id: String,
    /// Per-sender monotonic counter.
    pub sequence: u32,
    /// Send time, seconds since the Unix epoch.
    pub timestamp: f64,
    /// Application-defined bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(sender_id: impl Into<String>, sequence: u32, payload: Vec<u8>) -> Self {
        Self {
            sender_id: sender_id.into(),
            sequence,
            timestamp: unix_now(),
            payload,
        }
    }

    /// Total wire size.
    pub fn wire_size(&self) -> usize {
        ENVELOPE_HEADER_SIZE + self.sender_id.len() + self.payload.len()
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let id_len = u16::try_from(self.sender_id.len())
            .map_err(|_| EnvelopeError::SenderIdTooLong(self.sender_id.len()))?;
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| EnvelopeError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&id_len.to_be_bytes());
        buf.extend_from_slice(self.sender_id.as_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_bits().to_be_bytes());
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode from wire format. Trailing bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let mut reader = Reader { data, pos: 0 };

        let id_len = u16::from_be_bytes(reader.array()?) as usize;
        let sender_id = std::str::from_utf8(reader.take(id_len)?)
            .map_err(|_| EnvelopeError::InvalidSenderId)?
            .to_owned();
        let sequence = u32::from_be_bytes(reader.array()?);
        let timestamp = f64::from_bits(u64::from_be_bytes(reader.array()?));
        let payload_len = u32::from_be_bytes(reader.array()?) as usize;
        let payload = reader.take(payload_len)?.to_vec();

        if reader.pos != data.len() {
            return Err(EnvelopeError::TrailingBytes(data.len() - reader.pos));
        }

        Ok(Self {
            sender_id,
            sequence,
            timestamp,
            payload,
        })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.saturating_add(n);
        if end > self.data.len() {
            return Err(EnvelopeError::TooShort {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EnvelopeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Envelope encoding/decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Input data is shorter than required.
    #[error("envelope too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Bytes required so far.
        expected: usize,
        /// Actual bytes received.
        actual: usize,
    },

    /// The sender id is not UTF-8.
    #[error("sender id is not valid UTF-8")]
    InvalidSenderId,

    /// The sender id does not fit its length field.
    #[error("sender id too long: {0} bytes")]
    SenderIdTooLong(usize),

    /// The payload does not fit its length field.
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Bytes after the payload.
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
}

impl Classify for EnvelopeError {
    fn kind(&self) -> ErrorKind {
        match self {
            EnvelopeError::SenderIdTooLong(_) | EnvelopeError::PayloadTooLarge(_) => {
                ErrorKind::SendFailed
            }
            _ => ErrorKind::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let envelope = Envelope {
            sender_id: "p1".into(),
            sequence: 7,
            timestamp: 1.5,
            payload: vec![0xAA, 0xBB],
        };
        let encoded = envelope.encode().unwrap();

        assert_eq!(encoded.len(), envelope.wire_size());
        assert_eq!(&encoded[..4], &[0, 2, b'p', b'1']);
        assert_eq!(&encoded[4..8], &7u32.to_be_bytes());
        assert_eq!(&encoded[8..16], &1.5f64.to_bits().to_be_bytes());
        assert_eq!(&encoded[16..20], &2u32.to_be_bytes());
        assert_eq!(Envelope::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut encoded = Envelope::new("p1", 1, vec![1, 2, 3]).encode().unwrap();
        encoded.pop();
        assert!(matches!(
            Envelope::decode(&encoded),
            Err(EnvelopeError::TooShort { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_and_bad_utf8() {
        let mut encoded = Envelope::new("p1", 1, vec![]).encode().unwrap();
        encoded.push(0);
        assert_eq!(Envelope::decode(&encoded), Err(EnvelopeError::TrailingBytes(1)));

        let bad = [0, 1, 0xFF, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(Envelope::decode(&bad), Err(EnvelopeError::InvalidSenderId));
    }

    #[test]
    fn test_huge_length_is_too_short_not_panic() {
        let data = [0xFF, 0xFF, b'x'];
        assert!(matches!(
            Envelope::decode(&data),
            Err(EnvelopeError::TooShort { .. })
        ));
    }
}
