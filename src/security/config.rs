//! Security configuration surface and negotiated metadata.

use std::fmt;
use std::time::Duration;

use super::error::SecurityError;
use super::keys::{Certificate, Identity};
use super::trust::TrustPolicy;
use crate::core::DEFAULT_HANDSHAKE_RETRANSMIT;

/// Record protocol versions, numbered like their TLS counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    /// 1.0 (legacy).
    V1_0,
    /// 1.1 (legacy).
    V1_1,
    /// 1.2, the default floor.
    V1_2,
    /// 1.3.
    V1_3,
}

impl ProtocolVersion {
    /// Versions this build implements, oldest first.
    pub const SUPPORTED: [ProtocolVersion; 4] = [
        ProtocolVersion::V1_0,
        ProtocolVersion::V1_1,
        ProtocolVersion::V1_2,
        ProtocolVersion::V1_3,
    ];

    /// Wire code.
    pub fn code(self) -> u16 {
        match self {
            ProtocolVersion::V1_0 => 0x0301,
            ProtocolVersion::V1_1 => 0x0302,
            ProtocolVersion::V1_2 => 0x0303,
            ProtocolVersion::V1_3 => 0x0304,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::SUPPORTED.into_iter().find(|v| v.code() == code)
    }

    /// Highest version inside both ranges, if any.
    pub fn negotiate(
        local: (ProtocolVersion, ProtocolVersion),
        peer: (ProtocolVersion, ProtocolVersion),
    ) -> Option<ProtocolVersion> {
        let floor = local.0.max(peer.0);
        let ceiling = local.1.min(peer.1);
        (floor <= ceiling).then_some(ceiling)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolVersion::V1_0 => "1.0",
            ProtocolVersion::V1_1 => "1.1",
            ProtocolVersion::V1_2 => "1.2",
            ProtocolVersion::V1_3 => "1.3",
        };
        f.write_str(s)
    }
}

/// Security settings for one side of a connection.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Lowest acceptable version.
    pub min_version: ProtocolVersion,
    /// Highest offered version.
    pub max_version: ProtocolVersion,
    /// How the client verifies the server's chain.
    pub trust: TrustPolicy,
    /// Server identity. Required to accept connections.
    pub identity: Option<Identity>,
    /// How often a datagram handshake message is resent while unanswered.
    pub handshake_retransmit: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            min_version: ProtocolVersion::V1_2,
            max_version: ProtocolVersion::V1_3,
            trust: TrustPolicy::default(),
            identity: None,
            handshake_retransmit: DEFAULT_HANDSHAKE_RETRANSMIT,
        }
    }
}

impl SecurityConfig {
    /// Client-side config verifying with `trust`.
    pub fn client(trust: TrustPolicy) -> Self {
        Self {
            trust,
            ..Self::default()
        }
    }

    /// Server-side config presenting `identity`.
    pub fn server(identity: Identity) -> Self {
        Self {
            identity: Some(identity),
            ..Self::default()
        }
    }

    /// Set the minimum version.
    pub fn min_version(mut self, version: ProtocolVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Set the maximum version.
    pub fn max_version(mut self, version: ProtocolVersion) -> Self {
        self.max_version = version;
        self
    }

    /// Set the datagram handshake retransmit interval.
    pub fn handshake_retransmit(mut self, interval: Duration) -> Self {
        self.handshake_retransmit = interval;
        self
    }

    /// Check the version range is usable.
    pub fn validate(&self) -> Result<(), SecurityError> {
        if self.min_version > self.max_version {
            return Err(SecurityError::InvalidConfig(format!(
                "minimum version {} above maximum {}",
                self.min_version, self.max_version
            )));
        }
        if self.handshake_retransmit.is_zero() {
            return Err(SecurityError::InvalidConfig(
                "handshake retransmit interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn version_range(&self) -> (ProtocolVersion, ProtocolVersion) {
        (self.min_version, self.max_version)
    }
}

/// What the handshake negotiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityMetadata {
    /// Negotiated protocol version.
    pub version: ProtocolVersion,
    /// Cipher suite identifier.
    pub cipher_suite: &'static str,
    /// Chain presented by the peer, leaf first. Empty on the server side.
    pub peer_certificates: Vec<Certificate>,
}
