//! Security layer error types.

use thiserror::Error;

use crate::core::{Classify, ErrorKind};

/// Security layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SecurityError {
    /// Noise handshake failed (bad message, peer aborted, key mismatch).
    #[error("security handshake failed: {0}")]
    Handshake(String),

    /// No protocol version in common.
    #[error("security handshake failed: no common protocol version (local {local}, peer {peer})")]
    VersionMismatch {
        /// Local supported range, formatted.
        local: String,
        /// Peer supported range, formatted.
        peer: String,
    },

    /// The verifier rejected the presented certificate chain.
    #[error("security handshake failed: certificate rejected: {0}")]
    CertificateRejected(String),

    /// Session key derivation failed.
    #[error("security handshake failed: key derivation failed")]
    KeyDerivation,

    /// The configuration cannot be used for this role.
    #[error("invalid security configuration: {0}")]
    InvalidConfig(String),

    /// Record authentication failed.
    #[error("record authentication failed")]
    Decrypt,

    /// Record sealing failed.
    #[error("record encryption failed")]
    Encrypt,

    /// Record counter already seen or outside the replay window.
    #[error("replayed record {0}")]
    Replay(u64),

    /// Stream record arrived out of sequence.
    #[error("record out of sequence: expected {expected}, got {actual}")]
    OutOfSequence {
        /// Expected counter.
        expected: u64,
        /// Counter found on the record.
        actual: u64,
    },

    /// Record too short to carry a counter and a tag.
    #[error("record too short: {0} bytes")]
    Truncated(usize),

    /// Send counter exhausted; the connection must be replaced.
    #[error("record counter exhausted")]
    CounterExhausted,
}

impl SecurityError {
    /// Whether this error happened during negotiation rather than record
    /// protection.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            SecurityError::Handshake(_)
                | SecurityError::VersionMismatch { .. }
                | SecurityError::CertificateRejected(_)
                | SecurityError::KeyDerivation
        )
    }
}

impl Classify for SecurityError {
    fn kind(&self) -> ErrorKind {
        match self {
            e if e.is_handshake() => ErrorKind::HandshakeFailed,
            SecurityError::InvalidConfig(_) => ErrorKind::TransportSetupFailed,
            SecurityError::Encrypt => ErrorKind::SendFailed,
            SecurityError::CounterExhausted => ErrorKind::ConnectionLost,
            _ => ErrorKind::Protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_errors_are_distinct() {
        let rejected = SecurityError::CertificateRejected("unpinned".into());
        assert_eq!(rejected.kind(), ErrorKind::HandshakeFailed);
        assert!(rejected.to_string().starts_with("security handshake failed"));

        assert_eq!(SecurityError::Decrypt.kind(), ErrorKind::Protocol);
        assert_eq!(SecurityError::Replay(4).kind(), ErrorKind::Protocol);
        assert_eq!(
            SecurityError::InvalidConfig("no identity".into()).kind(),
            ErrorKind::TransportSetupFailed
        );
    }
}
