//! peerlink - Client Library
//!
//! One outbound connection with automatic reconnection.

mod backoff;
#[allow(clippy::module_inception)]
mod client;
mod observer;

pub use backoff::ReconnectPolicy;
pub use client::{
    Client, ClientBuilder, ClientConfig, ClientError, ClientEvent, ClientEvents, ClientState,
    DisconnectReason,
};
pub use observer::ClientObserver;
