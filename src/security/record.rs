//! Record protection with XChaCha20-Poly1305.
//!
//! A sealed frame body looks like:
//! ```text
//! [ counter (8, LE64) | ciphertext + tag (16) ]
//! ```
//! The frame type and flags stay in the clear but are authenticated:
//! AAD = `[ frame_type (1) | flags (1) | counter (8, LE64) ]`.
//!
//! Nonce = `[ direction (1) | zeros (15) | counter (8, LE64) ]`.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use zeroize::Zeroize;

use super::error::SecurityError;
use crate::core::{AEAD_NONCE_SIZE, AEAD_TAG_SIZE, RECORD_COUNTER_SIZE, RECORD_KEY_SIZE, REPLAY_WINDOW_SIZE};
use crate::transport::TransportKind;

const AAD_SIZE: usize = 2 + RECORD_COUNTER_SIZE;

/// Bytes a sealed record adds to its plaintext.
pub const RECORD_OVERHEAD: usize = RECORD_COUNTER_SIZE + AEAD_TAG_SIZE;

/// Which side of the handshake sealed a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Initiator to responder (0x00).
    InitiatorToResponder,
    /// Responder to initiator (0x01).
    ResponderToInitiator,
}

impl Direction {
    fn as_byte(self) -> u8 {
        match self {
            Direction::InitiatorToResponder => 0x00,
            Direction::ResponderToInitiator => 0x01,
        }
    }
}

fn nonce(direction: Direction, counter: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0] = direction.as_byte();
    nonce[AEAD_NONCE_SIZE - 8..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn aad(frame_type: u8, flags: u8, counter: u64) -> [u8; AAD_SIZE] {
    let mut aad = [0u8; AAD_SIZE];
    aad[0] = frame_type;
    aad[1] = flags;
    aad[2..].copy_from_slice(&counter.to_le_bytes());
    aad
}

/// A record key, zeroized on drop.
pub(crate) struct RecordKey([u8; RECORD_KEY_SIZE]);

impl RecordKey {
    pub(crate) fn from_bytes(key: [u8; RECORD_KEY_SIZE]) -> Self {
        Self(key)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }
}

impl Drop for RecordKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Seals outgoing records for one direction.
pub struct RecordSealer {
    cipher: XChaCha20Poly1305,
    direction: Direction,
    counter: u64,
}

impl RecordSealer {
    pub(crate) fn new(key: RecordKey, direction: Direction) -> Self {
        Self {
            cipher: key.cipher(),
            direction,
            counter: 0,
        }
    }

    /// Seal `plaintext` into a frame body bound to `frame_type` and `flags`.
    pub fn seal(&mut self, frame_type: u8, flags: u8, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let counter = self.counter;
        self.counter = counter.checked_add(1).ok_or(SecurityError::CounterExhausted)?;

        let ciphertext = self
            .cipher
            .encrypt(
                XNonce::from_slice(&nonce(self.direction, counter)),
                Payload {
                    msg: plaintext,
                    aad: &aad(frame_type, flags, counter),
                },
            )
            .map_err(|_| SecurityError::Encrypt)?;

        let mut body = Vec::with_capacity(RECORD_COUNTER_SIZE + ciphertext.len());
        body.extend_from_slice(&counter.to_le_bytes());
        body.extend_from_slice(&ciphertext);
        Ok(body)
    }
}

impl fmt::Debug for RecordSealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSealer")
            .field("direction", &self.direction)
            .field("counter", &self.counter)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
enum Acceptance {
    /// Stream records must be strictly consecutive.
    Sequential { next: u64 },
    /// Datagram records may be lost or reordered inside the window.
    Windowed(ReplayWindow),
}

/// Opens incoming records for one direction.
pub struct RecordOpener {
    cipher: XChaCha20Poly1305,
    direction: Direction,
    acceptance: Acceptance,
}

impl RecordOpener {
    pub(crate) fn new(key: RecordKey, direction: Direction, kind: TransportKind) -> Self {
        let acceptance = match kind {
            TransportKind::Stream => Acceptance::Sequential { next: 0 },
            TransportKind::Datagram => Acceptance::Windowed(ReplayWindow::new()),
        };
        Self {
            cipher: key.cipher(),
            direction,
            acceptance,
        }
    }

    /// Authenticate and decrypt a sealed frame body.
    ///
    /// The counter is only committed once the tag verifies, so forged
    /// records cannot advance the window.
    pub fn open(&mut self, frame_type: u8, flags: u8, body: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if body.len() < RECORD_OVERHEAD {
            return Err(SecurityError::Truncated(body.len()));
        }
        let mut counter_bytes = [0u8; RECORD_COUNTER_SIZE];
        counter_bytes.copy_from_slice(&body[..RECORD_COUNTER_SIZE]);
        let counter = u64::from_le_bytes(counter_bytes);

        match &self.acceptance {
            Acceptance::Sequential { next } if counter != *next => {
                return Err(SecurityError::OutOfSequence {
                    expected: *next,
                    actual: counter,
                });
            }
            Acceptance::Windowed(window) if window.is_replay(counter) => {
                return Err(SecurityError::Replay(counter));
            }
            _ => {}
        }

        let plaintext = self
            .cipher
            .decrypt(
                XNonce::from_slice(&nonce(self.direction, counter)),
                Payload {
                    msg: &body[RECORD_COUNTER_SIZE..],
                    aad: &aad(frame_type, flags, counter),
                },
            )
            .map_err(|_| SecurityError::Decrypt)?;

        match &mut self.acceptance {
            Acceptance::Sequential { next } => *next = counter + 1,
            Acceptance::Windowed(window) => window.mark(counter),
        }
        Ok(plaintext)
    }
}

impl fmt::Debug for RecordOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordOpener")
            .field("direction", &self.direction)
            .field("acceptance", &self.acceptance)
            .finish_non_exhaustive()
    }
}

/// Sliding anti-replay window over record counters.
///
/// Bit `i` of the bitmap records whether `highest - i` has been seen.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    bitmap: [u64; REPLAY_WINDOW_SIZE / 64],
    highest: u64,
    initialized: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            bitmap: [0; REPLAY_WINDOW_SIZE / 64],
            highest: 0,
            initialized: false,
        }
    }

    /// Whether `counter` was already seen or fell behind the window.
    pub fn is_replay(&self, counter: u64) -> bool {
        if !self.initialized || counter > self.highest {
            return false;
        }
        let diff = self.highest - counter;
        if diff >= REPLAY_WINDOW_SIZE as u64 {
            return true;
        }
        let bit = diff as usize;
        self.bitmap[bit / 64] & (1 << (bit % 64)) != 0
    }

    /// Record `counter` as seen. Call only after [`is_replay`](Self::is_replay)
    /// returned false and the record authenticated.
    pub fn mark(&mut self, counter: u64) {
        if !self.initialized {
            self.initialized = true;
            self.highest = counter;
        } else if counter > self.highest {
            self.shift(counter - self.highest);
            self.highest = counter;
        }

        let diff = self.highest - counter;
        if diff < REPLAY_WINDOW_SIZE as u64 {
            let bit = diff as usize;
            self.bitmap[bit / 64] |= 1 << (bit % 64);
        }
    }

    /// Check and mark in one step.
    pub fn check_and_update(&mut self, counter: u64) -> Result<(), SecurityError> {
        if self.is_replay(counter) {
            return Err(SecurityError::Replay(counter));
        }
        self.mark(counter);
        Ok(())
    }

    /// Move every bit `shift` positions towards older counters.
    fn shift(&mut self, shift: u64) {
        if shift >= REPLAY_WINDOW_SIZE as u64 {
            self.bitmap = [0; REPLAY_WINDOW_SIZE / 64];
            return;
        }

        let words = (shift / 64) as usize;
        let bits = (shift % 64) as u32;

        if words > 0 {
            for i in (words..self.bitmap.len()).rev() {
                self.bitmap[i] = self.bitmap[i - words];
            }
            for word in self.bitmap.iter_mut().take(words) {
                *word = 0;
            }
        }

        if bits > 0 {
            // Carry flows from each word into the next older one.
            let mut carry = 0u64;
            for word in self.bitmap.iter_mut() {
                let next_carry = *word >> (64 - bits);
                *word = (*word << bits) | carry;
                carry = next_carry;
            }
        }
    }
}
