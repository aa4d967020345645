//! # peerlink
//!
//! Peer-to-peer chat and game-state transport over direct network paths.
//!
//! - **Connections**: stream (TCP) and datagram (UDP) transports behind one
//!   state machine: `setup → preparing → ready → (waiting | failed) → cancelled`
//! - **Security**: an optional TLS/DTLS-like decorator with version
//!   negotiation and pluggable certificate trust
//! - **Server**: accept, register, broadcast, and graceful shutdown
//! - **Client**: one outbound connection with exponential-backoff reconnection
//! - **Sync**: per-sender sequenced datagram updates ("last state wins") and
//!   request/response with timeouts
//!
//! ## Feature Flags
//!
//! - `sync` (default): Sequenced datagram protocol and requests
//! - `client` (default): Reconnecting client
//! - `server` (default): Relay server
//!
//! ## Modules
//!
//! - [`core`]: Constants and the classified error taxonomy (always included)
//! - [`transport`]: Connections, framing, endpoints (always included)
//! - [`security`]: Secure transport decorator (always included)
//! - [`sync`]: Sequenced datagrams (requires `sync` feature)
//! - [`client`]: Client (requires `client` feature)
//! - [`server`]: Server (requires `server` feature)
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use peerlink::prelude::*;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let (server, _server_events) = Server::start(ServerBuilder::new().port(0).build()).await?;
//!
//! let (client, mut events) = Client::new(ClientBuilder::new().build());
//! client.connect("127.0.0.1", server.local_port())?;
//!
//! while let Some(event) = events.recv().await {
//!     if event == ClientEvent::Connected {
//!         client.send(b"hello".to_vec()).await?;
//!         break;
//!     }
//! }
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Connections and the secure decorator (always included)
pub mod security;
pub mod transport;

// Sequenced datagram layer (feature-gated)
#[cfg(feature = "sync")]
#[cfg_attr(docsrs, doc(cfg(feature = "sync")))]
pub mod sync;

// High-level APIs (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
///
/// ```rust
/// use peerlink::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{Classify, ErrorKind, Failure};
    pub use crate::security::{
        Certificate, Identity, ProtocolVersion, SecurityConfig, SecurityMetadata, TrustPolicy,
    };
    pub use crate::transport::{
        Connection, ConnectionEvent, ConnectionEvents, ConnectionId, ConnectionState, Endpoint,
        Message, Parameters, TransportError, TransportKind,
    };

    #[cfg(feature = "sync")]
    pub use crate::sync::{Envelope, Requester, SequencedChannel, SequencedReceiver, SequencedSender};

    #[cfg(feature = "client")]
    pub use crate::client::{
        Client, ClientBuilder, ClientConfig, ClientEvent, ClientEvents, ClientObserver,
        ClientState, DisconnectReason, ReconnectPolicy,
    };

    #[cfg(feature = "server")]
    pub use crate::server::{
        BroadcastReport, Server, ServerBuilder, ServerConfig, ServerEvent, ServerEvents,
        ServiceAdvertisement,
    };
}

// Re-export commonly used items at crate root
pub use crate::core::{Classify, ErrorKind, Failure};
pub use crate::transport::{Connection, ConnectionState, Endpoint, Parameters, TransportKind};
