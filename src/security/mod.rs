//! Secure transport decorator.
//!
//! Wraps a stream connection (TLS-like) or a datagram connection (DTLS-like)
//! with a handshake before `ready` and record protection afterwards.
//!
//! - **Handshake**: `Noise_NX_25519_ChaChaPoly_BLAKE2s` carrying a
//!   [`ProtocolVersion`] negotiation and the responder's certificate chain
//! - **Verification**: [`TrustPolicy`] (trust store, pinned certificate,
//!   custom verifier, or insecure in debug builds only)
//! - **Records**: XChaCha20-Poly1305 with explicit counters; sequential on
//!   streams, anti-replay window on datagrams
//!
//! A rejected handshake fails the connection with
//! [`ErrorKind::HandshakeFailed`](crate::core::ErrorKind::HandshakeFailed).

mod config;
mod error;
mod handshake;
mod keys;
pub(crate) mod layer;
mod record;
mod trust;

pub use config::{ProtocolVersion, SecurityConfig, SecurityMetadata};
pub use error::SecurityError;
pub use handshake::CIPHER_SUITE;
pub use keys::{Certificate, Identity, MAX_CERTIFICATE_SIZE, MAX_CHAIN_LENGTH, StaticKeypair};
pub use record::{RECORD_OVERHEAD, ReplayWindow};
pub use trust::{CertificateVerifier, TrustPolicy, TrustStore};
