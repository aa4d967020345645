//! Transport layer error types.

use std::io;

use thiserror::Error;

use super::frame::FrameError;
use crate::core::{Classify, ErrorKind};
use crate::security::SecurityError;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The operation requires the `ready` state.
    #[error("connection not ready (state: {state})")]
    NotReady {
        /// Name of the state the connection was in.
        state: &'static str,
    },

    /// Payload does not fit in one frame or datagram.
    #[error("payload of {size} bytes exceeds maximum of {max}")]
    PayloadTooLarge {
        /// Payload size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// The endpoint could not be resolved or the socket could not be created.
    #[error("transport setup failed: {0}")]
    Setup(String),

    /// Frame parsing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error on an established stream. Displayed by kind only; raw
    /// OS error codes stay out of descriptions.
    #[error("i/o error: {}", .0.kind())]
    Io(#[from] io::Error),

    /// A single datagram could not be handed to the socket.
    #[error("datagram send failed: {}", .0.kind())]
    DatagramSend(io::Error),

    /// Security negotiation or record protection failed.
    #[error(transparent)]
    Security(#[from] SecurityError),

    /// Connect did not reach `ready` within the configured timeout.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ClosedByPeer,

    /// The connection went away while the operation was pending.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The connection was cancelled locally.
    #[error("connection cancelled")]
    Cancelled,
}

impl TransportError {
    /// Check if this error is fatal to the connection it occurred on.
    ///
    /// Datagram send failures and oversized payloads only fail the one send.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TransportError::NotReady { .. }
                | TransportError::PayloadTooLarge { .. }
                | TransportError::DatagramSend(_)
        )
    }

    /// Whether a failed connect may be retried while `waiting`.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NetworkUnreachable
                    | io::ErrorKind::HostUnreachable
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl Classify for TransportError {
    fn kind(&self) -> ErrorKind {
        match self {
            TransportError::NotReady { .. } => ErrorKind::NotReady,
            TransportError::PayloadTooLarge { .. } | TransportError::DatagramSend(_) => {
                ErrorKind::SendFailed
            }
            TransportError::Setup(_) => ErrorKind::TransportSetupFailed,
            TransportError::Frame(_) => ErrorKind::Protocol,
            TransportError::Io(_)
            | TransportError::ClosedByPeer
            | TransportError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            TransportError::Security(e) => e.kind(),
            TransportError::ConnectTimeout(_) => ErrorKind::Timeout,
            TransportError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Failure;

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::ClosedByPeer.is_fatal());
        assert!(TransportError::Cancelled.is_fatal());
        assert!(TransportError::Io(io::Error::other("reset")).is_fatal());

        assert!(!TransportError::NotReady { state: "setup" }.is_fatal());
        assert!(!TransportError::DatagramSend(io::Error::other("full")).is_fatal());
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            TransportError::NotReady { state: "waiting" }.kind(),
            ErrorKind::NotReady
        );
        assert_eq!(
            TransportError::Setup("bad address".into()).kind(),
            ErrorKind::TransportSetupFailed
        );
        assert_eq!(
            TransportError::Frame(FrameError::InvalidType(9)).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            TransportError::ConnectTimeout(std::time::Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(TransportError::ClosedByPeer.kind(), ErrorKind::ConnectionLost);
        assert_eq!(TransportError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_io_description_hides_os_details() {
        let refused = io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)",
        );
        let failure = Failure::from_error(&TransportError::Io(refused));
        assert_eq!(failure.kind, ErrorKind::ConnectionLost);
        assert_eq!(failure.description, "i/o error: connection refused");

        let full = TransportError::DatagramSend(io::Error::new(
            io::ErrorKind::WouldBlock,
            "Resource temporarily unavailable (os error 11)",
        ));
        assert!(!full.to_string().contains("os error"));
    }

    #[test]
    fn test_refused_connect_is_transient() {
        let refused = TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_transient());
        assert!(!TransportError::Setup("no such host".into()).is_transient());
    }
}
