//! Protocol constants shared by every layer.
//!
//! Wire-level values are fixed: changing them breaks interoperability with
//! peers built from another revision.

use std::time::Duration;

// =============================================================================
// STREAM FRAMING
// =============================================================================

/// Length prefix size (u32, big-endian).
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Frame header size following the length prefix (type + flags).
pub const FRAME_HEADER_SIZE: usize = 2;

/// Default maximum frame body accepted on a stream connection (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Chunk size requested from the socket by a stream receive loop.
pub const STREAM_READ_CHUNK: usize = 64 * 1024;

// =============================================================================
// SECURE RECORDS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Explicit record counter carried in every sealed record (u64, little-endian).
pub const RECORD_COUNTER_SIZE: usize = 8;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Record key size.
pub const RECORD_KEY_SIZE: usize = 32;

/// Handshake hash size (BLAKE2s).
pub const HASH_SIZE: usize = 32;

/// Anti-replay window for datagram records, in records.
pub const REPLAY_WINDOW_SIZE: usize = 2048;

/// Largest Noise message snow will produce or accept.
pub const MAX_HANDSHAKE_MESSAGE: usize = 65_535;

// =============================================================================
// TIMING DEFAULTS
// =============================================================================

/// Connect attempts that have not reached `ready` by then are failed.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before a `waiting` connection re-enters `preparing`.
pub const DEFAULT_WAITING_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Transient connect failures tolerated before the connection fails.
pub const DEFAULT_WAITING_RETRY_LIMIT: u32 = 2;

/// Datagram handshake retransmission interval.
pub const DEFAULT_HANDSHAKE_RETRANSMIT: Duration = Duration::from_millis(250);

/// Time allowed for close-marked messages to flush during shutdown/disconnect.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Base reconnection delay.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(500);

/// Ceiling for the reconnection delay.
pub const DEFAULT_RECONNECT_CEILING: Duration = Duration::from_secs(30);

/// Consecutive failed reconnection attempts before giving up.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;

// =============================================================================
// SERVER
// =============================================================================

/// Inbound datagrams buffered per peer before further ones are dropped.
pub const DATAGRAM_PEER_QUEUE: usize = 256;

/// A datagram peer silent for this long is considered gone.
pub const DEFAULT_DATAGRAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on concurrently registered connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
