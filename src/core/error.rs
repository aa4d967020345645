//! Classified error taxonomy.
//!
//! Every layer has its own `thiserror` enum; consumers only ever see the
//! [`ErrorKind`] it maps to plus a human-readable description.

use std::fmt;

/// The classified error kinds surfaced across the component boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bind or connect could not even begin (bad address, resolution failure).
    TransportSetupFailed,
    /// Security negotiation was rejected.
    HandshakeFailed,
    /// An established (or establishing) connection broke.
    ConnectionLost,
    /// A single send attempt failed.
    SendFailed,
    /// An operation exceeded its deadline.
    Timeout,
    /// The caller cancelled the operation.
    Cancelled,
    /// The operation needs a `ready`/`connected` state that is not current.
    NotReady,
    /// The peer sent something the framing layer cannot accept.
    Protocol,
}

impl ErrorKind {
    /// Whether the client's reconnection policy may retry after this error.
    ///
    /// Cancellation, rejected handshakes and setup failures are never retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ConnectionLost | ErrorKind::Timeout)
    }

    /// Short stable label, suitable for metrics keys or UI lookups.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::TransportSetupFailed => "transport-setup-failed",
            ErrorKind::HandshakeFailed => "handshake-failed",
            ErrorKind::ConnectionLost => "connection-lost",
            ErrorKind::SendFailed => "send-failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::NotReady => "not-ready",
            ErrorKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a layer-specific error onto the public taxonomy.
pub trait Classify {
    /// The classified kind of this error.
    fn kind(&self) -> ErrorKind;
}

/// A classified error as handed to the consuming UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Classified kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub description: String,
}

impl Failure {
    /// Build a failure from any classified error.
    pub fn from_error<E: Classify + fmt::Display>(error: &E) -> Self {
        Self {
            kind: error.kind(),
            description: error.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::ConnectionLost.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());

        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::HandshakeFailed.is_retryable());
        assert!(!ErrorKind::TransportSetupFailed.is_retryable());
        assert!(!ErrorKind::SendFailed.is_retryable());
    }

    #[test]
    fn test_failure_display() {
        let failure = Failure {
            kind: ErrorKind::Timeout,
            description: "connect timed out".into(),
        };
        assert_eq!(failure.to_string(), "timeout: connect timed out");
    }
}
