//! peerlink - Server Library
//!
//! Listener, connection registry and broadcast relay.

mod advertise;
mod registry;
#[allow(clippy::module_inception)]
mod server;

pub use advertise::{
    MAX_INSTANCE_NAME, MAX_SERVICE_NAME, MAX_TXT_ENTRY, ServiceAdvertisement, ServiceAdvertiser,
};
pub use registry::{ConnectionRegistry, RegistryEntry};
pub use server::{
    BroadcastReport, ListenerState, Server, ServerBuilder, ServerConfig, ServerError, ServerEvent,
    ServerEvents,
};
