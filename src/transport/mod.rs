//! peerlink - Transport Layer
//!
//! One bidirectional stream (TCP) or datagram (UDP) association per
//! [`Connection`], each driven by its own task:
//!
//! - **Framing**: [`Frame`] and [`FrameDecoder`], a 4-byte big-endian length
//!   prefix on streams and one frame per datagram
//! - **Lifecycle**: [`ConnectionState`] with a single-writer driver
//! - **Endpoints**: [`Endpoint`] as host/port, socket address or service name
//! - **Statistics**: [`TransferSnapshot`] counters per connection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Server / Client / Sync           │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │   state machine, framing, driver        │
//! ├─────────────────────────────────────────┤
//! │   Security Layer (optional decorator)   │
//! ├─────────────────────────────────────────┤
//! │            TCP  |  UDP                  │
//! └─────────────────────────────────────────┘
//! ```

mod connection;
mod endpoint;
mod error;
mod frame;
pub(crate) mod link;
mod probe;
mod state;
mod stats;

pub(crate) use connection::cancelled;
pub use connection::{
    Connection, ConnectionEvent, ConnectionEvents, ConnectionId, Message, Parameters, PendingSend,
};
pub use endpoint::{Endpoint, ServiceResolver, TransportKind};
pub use error::{TransportError, TransportResult};
pub use frame::{Frame, FrameDecoder, FrameError, FrameFlags, FrameType};
pub use probe::probe;
pub use state::ConnectionState;
pub use stats::{TransferSnapshot, TransferStats};
