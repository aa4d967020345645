//! Sequenced state updates over a datagram connection.

use tracing::trace;

use super::envelope::Envelope;
use super::receiver::{ReceiveResult, SequencedReceiver};
use super::sender::SequencedSender;
use crate::transport::{Connection, ConnectionEvent, ConnectionEvents, TransportError};

/// Publishes this side's state and yields the latest state of every peer.
///
/// Works over a direct datagram connection or through a relay server: the
/// envelope carries the sender id, so relayed updates from several peers
/// are filtered independently.
#[derive(Debug)]
pub struct SequencedChannel {
    connection: Connection,
    events: ConnectionEvents,
    sender: SequencedSender,
    receiver: SequencedReceiver,
}

impl SequencedChannel {
    /// Wrap a connection and its event stream.
    pub fn new(connection: Connection, events: ConnectionEvents, sender_id: impl Into<String>) -> Self {
        Self {
            connection,
            events,
            sender: SequencedSender::new(sender_id),
            receiver: SequencedReceiver::new(),
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Per-sender filter state.
    pub fn receiver(&self) -> &SequencedReceiver {
        &self.receiver
    }

    /// Send one state update; returns its sequence.
    pub async fn publish(&mut self, payload: Vec<u8>) -> Result<u32, TransportError> {
        let envelope = self.sender.next_envelope(payload);
        let bytes = encode(&envelope, self.connection.max_payload())?;
        self.connection.send(bytes, false).await?;
        Ok(envelope.sequence)
    }

    /// Send one state update without completion reporting.
    pub fn publish_idempotent(&mut self, payload: Vec<u8>) -> u32 {
        let envelope = self.sender.next_envelope(payload);
        match encode(&envelope, self.connection.max_payload()) {
            Ok(bytes) => self.connection.send_idempotent(bytes),
            Err(e) => trace!(error = %e, "dropping unencodable update"),
        }
        envelope.sequence
    }

    /// Next envelope newer than anything seen from its sender. Stale and
    /// malformed datagrams are skipped. `None` once the connection is gone.
    pub async fn next_update(&mut self) -> Option<Envelope> {
        loop {
            match self.events.recv().await? {
                ConnectionEvent::Message(message) => {
                    match self.receiver.receive_raw(&message.payload) {
                        Ok((ReceiveResult::Applied { .. }, envelope)) => return Some(envelope),
                        Ok((ReceiveResult::Stale { received, highest }, envelope)) => {
                            trace!(sender = %envelope.sender_id, received, highest, "stale update");
                        }
                        Err(e) => trace!(error = %e, "dropping malformed update"),
                    }
                }
                ConnectionEvent::State(state) => trace!(%state, "channel connection state"),
            }
        }
    }
}

fn encode(envelope: &Envelope, max: usize) -> Result<Vec<u8>, TransportError> {
    envelope.encode().map_err(|_| TransportError::PayloadTooLarge {
        size: envelope.wire_size(),
        max,
    })
}
