//! Receiver-side sequencing
//!
//! Keeps the highest sequence seen per sender and applies only newer
//! envelopes ("last state wins").

use std::collections::HashMap;

use super::envelope::{Envelope, EnvelopeError};

/// Result of receiving an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveResult {
    /// Newer than anything seen from this sender; apply it
    Applied {
        /// The envelope's sequence
        sequence: u32,
    },
    /// Not newer than the highest seen; discard it
    Stale {
        /// The stale sequence received
        received: u32,
        /// Highest sequence seen from this sender
        highest: u32,
    },
}

impl ReceiveResult {
    /// Check if the envelope should be applied
    pub fn is_applied(&self) -> bool {
        matches!(self, ReceiveResult::Applied { .. })
    }
}

/// Per-sender "highest sequence seen" filter
#[derive(Debug, Clone, Default)]
pub struct SequencedReceiver {
    highest: HashMap<String, u32>,
}

impl SequencedReceiver {
    /// Create a new receiver
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence seen from `sender_id`
    pub fn highest_seen(&self, sender_id: &str) -> Option<u32> {
        self.highest.get(sender_id).copied()
    }

    /// Number of senders tracked
    pub fn senders(&self) -> usize {
        self.highest.len()
    }

    /// Process a raw envelope from wire format
    pub fn receive_raw(&mut self, data: &[u8]) -> Result<(ReceiveResult, Envelope), EnvelopeError> {
        let envelope = Envelope::decode(data)?;
        let result = self.receive(&envelope);
        Ok((result, envelope))
    }

    /// Process an already-decoded envelope
    pub fn receive(&mut self, envelope: &Envelope) -> ReceiveResult {
        let sequence = envelope.sequence;
        match self.highest.get_mut(&envelope.sender_id) {
            Some(highest) if sequence <= *highest => ReceiveResult::Stale {
                received: sequence,
                highest: *highest,
            },
            Some(highest) => {
                *highest = sequence;
                ReceiveResult::Applied { sequence }
            }
            None => {
                self.highest.insert(envelope.sender_id.clone(), sequence);
                ReceiveResult::Applied { sequence }
            }
        }
    }

    /// Drop a sender's history (it left, or restarted its counter)
    pub fn forget(&mut self, sender_id: &str) -> Option<u32> {
        self.highest.remove(sender_id)
    }

    /// Reset receiver state
    pub fn reset(&mut self) {
        self.highest.clear();
    }
}
