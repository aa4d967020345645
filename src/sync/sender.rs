//! Sender-side sequencing.

use super::envelope::Envelope;

/// Stamps outgoing state updates with a per-sender monotonic sequence.
#[derive(Debug, Clone)]
pub struct SequencedSender {
    sender_id: String,
    /// Last sequence handed out; 0 means none yet.
    sequence: u32,
}

impl SequencedSender {
    /// Create a sender; the first envelope carries sequence 1.
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            sequence: 0,
        }
    }

    /// Sender identifier.
    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Last sequence handed out.
    pub fn current_sequence(&self) -> u32 {
        self.sequence
    }

    /// Wrap `payload` in the next envelope.
    ///
    /// The counter wraps after `u32::MAX`; receivers then treat the sender
    /// as stale until they [`forget`](super::SequencedReceiver::forget) it.
    pub fn next_envelope(&mut self, payload: Vec<u8>) -> Envelope {
        self.sequence = self.sequence.wrapping_add(1);
        Envelope::new(self.sender_id.clone(), self.sequence, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_increments_once_per_envelope() {
        let mut sender = SequencedSender::new("p1");
        assert_eq!(sender.current_sequence(), 0);

        let first = sender.next_envelope(b"a".to_vec());
        let second = sender.next_envelope(b"b".to_vec());
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert_eq!(second.sender_id, "p1");
        assert!(second.timestamp >= first.timestamp);
    }
}
