//! Connection lifecycle state machine.
//!
//! ```text
//! setup ──► preparing ──► ready ──► failed ──► cancelled
//!              ▲  │         │
//!              │  ▼         ▼
//!             waiting ──► failed
//! ```
//!
//! Every state may move to `cancelled`. `failed` is terminal for a
//! connection instance; retrying means creating a new connection.

use std::fmt;

use crate::core::Failure;

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, negotiation not started yet.
    Setup,
    /// Resolving, connecting or handshaking.
    Preparing,
    /// Send and receive are accepted.
    Ready,
    /// A transient error occurred; the transport will retry.
    Waiting(Failure),
    /// Permanent failure, surfaced once to the owner.
    Failed(Failure),
    /// Cancelled locally; the socket is released.
    Cancelled,
}

impl ConnectionState {
    /// Short state name.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Setup => "setup",
            ConnectionState::Preparing => "preparing",
            ConnectionState::Ready => "ready",
            ConnectionState::Waiting(_) => "waiting",
            ConnectionState::Failed(_) => "failed",
            ConnectionState::Cancelled => "cancelled",
        }
    }

    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (Cancelled, _) => false,
            (_, Cancelled) => true,
            (Setup, Preparing | Failed(_)) => true,
            (Preparing, Ready | Waiting(_) | Failed(_)) => true,
            (Waiting(_), Preparing | Failed(_)) => true,
            (Ready, Waiting(_) | Failed(_)) => true,
            _ => false,
        }
    }

    /// Check if this is a terminal state (`failed` or `cancelled`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_) | ConnectionState::Cancelled)
    }

    /// Check if send and receive are currently accepted.
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// The failure carried by `waiting` or `failed`.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            ConnectionState::Waiting(f) | ConnectionState::Failed(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failure() {
            Some(failure) => write!(f, "{} ({})", self.name(), failure),
            None => f.write_str(self.name()),
        }
    }
}
