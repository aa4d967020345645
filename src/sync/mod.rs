//! peerlink - Sync Layer
//!
//! Implements:
//! - Per-sender monotonic sequencing of datagram state updates
//! - "Last state wins" filtering of reordered or duplicated updates
//! - Request/response exchanges with per-request timeouts

mod channel;
mod envelope;
mod receiver;
mod request;
mod sender;

pub use channel::SequencedChannel;
pub use envelope::{ENVELOPE_HEADER_SIZE, Envelope, EnvelopeError};
pub use receiver::{ReceiveResult, SequencedReceiver};
pub use request::{IncomingRequest, IncomingRequests, REQUEST_HEADER_SIZE, RequestError, Requester};
pub use sender::SequencedSender;
