//! Noise_NX handshake with version negotiation.
//!
//! ```text
//! Noise_NX(rs):
//!   -> e                     ClientHello { min, max }            (clear)
//!   <- e, ee, s, es          ServerHello { version, chain }      (encrypted)
//! ```
//!
//! The responder's static key doubles as the leaf certificate: the
//! initiator checks that the presented leaf equals the key Noise
//! authenticated, then hands the chain to its verifier. Record keys are
//! expanded from the handshake hash.

use hkdf::Hkdf;
use sha2::Sha256;
use snow::{Builder, HandshakeState};
use zeroize::Zeroize;

use super::config::{ProtocolVersion, SecurityConfig, SecurityMetadata};
use super::error::SecurityError;
use super::keys::Certificate;
use super::record::{Direction, RecordKey, RecordOpener, RecordSealer};
use super::trust::CertificateVerifier;
use crate::core::{HASH_SIZE, MAX_HANDSHAKE_MESSAGE, RECORD_KEY_SIZE};
use crate::transport::TransportKind;

/// Noise protocol pattern.
pub(crate) const NOISE_PATTERN: &str = "Noise_NX_25519_ChaChaPoly_BLAKE2s";

/// Cipher suite reported in [`SecurityMetadata`].
pub const CIPHER_SUITE: &str = "NOISE_NX_25519_XCHACHA20_POLY1305_BLAKE2S";

const KEY_LABEL: &[u8] = b"peerlink v1 record keys";

const HELLO_ACCEPT: u8 = 0x00;
const HELLO_REJECT_VERSION: u8 = 0x01;

fn handshake_err(e: snow::Error) -> SecurityError {
    SecurityError::Handshake(e.to_string())
}

fn builder<'a>() -> Result<Builder<'a>, SecurityError> {
    let params = NOISE_PATTERN.parse().map_err(handshake_err)?;
    Ok(Builder::new(params))
}

/// Both directions of record protection plus negotiated metadata.
pub struct Established {
    pub(crate) sealer: RecordSealer,
    pub(crate) opener: RecordOpener,
    pub(crate) metadata: SecurityMetadata,
}

impl Established {
    /// Negotiated metadata.
    pub fn metadata(&self) -> &SecurityMetadata {
        &self.metadata
    }

    fn derive(
        state: &HandshakeState,
        initiator: bool,
        kind: TransportKind,
        metadata: SecurityMetadata,
    ) -> Result<Self, SecurityError> {
        let hash = state.get_handshake_hash();
        if hash.len() != HASH_SIZE {
            return Err(SecurityError::KeyDerivation);
        }

        let hk = Hkdf::<Sha256>::from_prk(hash).map_err(|_| SecurityError::KeyDerivation)?;
        let mut material = [0u8; 2 * RECORD_KEY_SIZE];
        hk.expand(KEY_LABEL, &mut material)
            .map_err(|_| SecurityError::KeyDerivation)?;

        let mut to_responder = [0u8; RECORD_KEY_SIZE];
        let mut to_initiator = [0u8; RECORD_KEY_SIZE];
        to_responder.copy_from_slice(&material[..RECORD_KEY_SIZE]);
        to_initiator.copy_from_slice(&material[RECORD_KEY_SIZE..]);
        material.zeroize();

        let to_responder = RecordKey::from_bytes(to_responder);
        let to_initiator = RecordKey::from_bytes(to_initiator);
        let (sealer, opener) = if initiator {
            (
                RecordSealer::new(to_responder, Direction::InitiatorToResponder),
                RecordOpener::new(to_initiator, Direction::ResponderToInitiator, kind),
            )
        } else {
            (
                RecordSealer::new(to_initiator, Direction::ResponderToInitiator),
                RecordOpener::new(to_responder, Direction::InitiatorToResponder, kind),
            )
        };

        Ok(Self {
            sealer,
            opener,
            metadata,
        })
    }
}

/// Initiator side: produces the first message, consumes the response.
pub(crate) struct InitiatorHandshake {
    state: HandshakeState,
    message: Vec<u8>,
}

impl InitiatorHandshake {
    /// Build the first message offering `config`'s version range.
    pub(crate) fn start(config: &SecurityConfig) -> Result<Self, SecurityError> {
        config.validate()?;
        let mut state = builder()?.build_initiator().map_err(handshake_err)?;

        let hello = encode_range(config.version_range());
        let mut buf = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        let len = state.write_message(&hello, &mut buf).map_err(handshake_err)?;
        buf.truncate(len);

        Ok(Self {
            state,
            message: buf,
        })
    }

    /// The first message, kept for datagram retransmission.
    pub(crate) fn message(&self) -> &[u8] {
        &self.message
    }

    /// Process the responder's reply and verify its certificate chain.
    pub(crate) fn finish(
        mut self,
        response: &[u8],
        config: &SecurityConfig,
        kind: TransportKind,
    ) -> Result<Established, SecurityError> {
        let mut payload = vec![0u8; MAX_HANDSHAKE_MESSAGE];
        let len = self
            .state
            .read_message(response, &mut payload)
            .map_err(handshake_err)?;
        payload.truncate(len);

        let hello = ServerHello::decode(&payload)?;
        let (version, chain) = match hello {
            ServerHello::RejectVersion { min, max } => {
                return Err(SecurityError::VersionMismatch {
                    local: format_range(config.version_range()),
                    peer: format_range((min, max)),
                });
            }
            ServerHello::Accept { version, chain } => (version, chain),
        };

        if version < config.min_version || version > config.max_version {
            return Err(SecurityError::Handshake(format!(
                "peer selected version {version} outside offered range"
            )));
        }

        let remote_static = self
            .state
            .get_remote_static()
            .ok_or_else(|| SecurityError::Handshake("peer sent no static key".into()))?;
        match chain.first() {
            Some(leaf) if leaf.as_bytes() == remote_static => {}
            _ => {
                return Err(SecurityError::CertificateRejected(
                    "leaf certificate does not match handshake key".into(),
                ));
            }
        }
        config.trust.verify(&chain)?;

        let metadata = SecurityMetadata {
            version,
            cipher_suite: CIPHER_SUITE,
            peer_certificates: chain,
        };
        Established::derive(&self.state, true, kind, metadata)
    }
}

/// What the responder produced for one first message.
pub(crate) struct Response {
    /// Second message; always sent, even when negotiation failed.
    pub(crate) reply: Vec<u8>,
    /// Keys on success, the rejection reason otherwise.
    pub(crate) outcome: Result<Established, SecurityError>,
}

/// Answer a first message as the responder.
pub(crate) fn respond(
    config: &SecurityConfig,
    kind: TransportKind,
    message: &[u8],
) -> Result<Response, SecurityError> {
    config.validate()?;
    let identity = config
        .identity
        .as_ref()
        .ok_or_else(|| SecurityError::InvalidConfig("accepting side needs an identity".into()))?;

    let mut state = builder()?
        .local_private_key(identity.keypair().private_key())
        .build_responder()
        .map_err(handshake_err)?;

    let mut payload = vec![0u8; MAX_HANDSHAKE_MESSAGE];
    let len = state.read_message(message, &mut payload).map_err(handshake_err)?;
    let peer_range = decode_range(&payload[..len])?;

    let negotiated = ProtocolVersion::negotiate(config.version_range(), peer_range);
    let hello = match negotiated {
        Some(version) => ServerHello::Accept {
            version,
            chain: identity.certificate_chain(),
        },
        None => ServerHello::RejectVersion {
            min: config.min_version,
            max: config.max_version,
        },
    };

    let mut reply = vec![0u8; MAX_HANDSHAKE_MESSAGE];
    let len = state
        .write_message(&hello.encode(), &mut reply)
        .map_err(handshake_err)?;
    reply.truncate(len);

    let outcome = match negotiated {
        Some(version) => Established::derive(
            &state,
            false,
            kind,
            SecurityMetadata {
                version,
                cipher_suite: CIPHER_SUITE,
                peer_certificates: Vec::new(),
            },
        ),
        None => Err(SecurityError::VersionMismatch {
            local: format_range(config.version_range()),
            peer: format_range(peer_range),
        }),
    };

    Ok(Response { reply, outcome })
}

fn format_range((min, max): (ProtocolVersion, ProtocolVersion)) -> String {
    format!("{min}..={max}")
}

fn encode_range((min, max): (ProtocolVersion, ProtocolVersion)) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf[..2].copy_from_slice(&min.code().to_be_bytes());
    buf[2..].copy_from_slice(&max.code().to_be_bytes());
    buf
}

fn decode_version(bytes: &[u8]) -> Result<ProtocolVersion, SecurityError> {
    let code = u16::from_be_bytes([bytes[0], bytes[1]]);
    ProtocolVersion::from_code(code)
        .ok_or_else(|| SecurityError::Handshake(format!("unknown protocol version 0x{code:04x}")))
}

fn decode_range(bytes: &[u8]) -> Result<(ProtocolVersion, ProtocolVersion), SecurityError> {
    if bytes.len() != 4 {
        return Err(SecurityError::Handshake("malformed version offer".into()));
    }
    Ok((decode_version(&bytes[..2])?, decode_version(&bytes[2..])?))
}

#[derive(Debug, PartialEq, Eq)]
enum ServerHello {
    Accept {
        version: ProtocolVersion,
        chain: Vec<Certificate>,
    },
    RejectVersion {
        min: ProtocolVersion,
        max: ProtocolVersion,
    },
}

impl ServerHello {
    fn encode(&self) -> Vec<u8> {
        match self {
            ServerHello::Accept { version, chain } => {
                let mut buf = vec![HELLO_ACCEPT];
                buf.extend_from_slice(&version.code().to_be_bytes());
                // Both length fields are bounded by `Identity`.
                buf.push(chain.len() as u8);
                for cert in chain {
                    buf.extend_from_slice(&(cert.as_bytes().len() as u16).to_be_bytes());
                    buf.extend_from_slice(cert.as_bytes());
                }
                buf
            }
            ServerHello::RejectVersion { min, max } => {
                let mut buf = vec![HELLO_REJECT_VERSION];
                buf.extend_from_slice(&encode_range((*min, *max)));
                buf
            }
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, SecurityError> {
        let malformed = || SecurityError::Handshake("malformed server hello".into());

        let (&status, rest) = bytes.split_first().ok_or_else(malformed)?;
        match status {
            HELLO_REJECT_VERSION => {
                let (min, max) = decode_range(rest)?;
                Ok(ServerHello::RejectVersion { min, max })
            }
            HELLO_ACCEPT => {
                if rest.len() < 3 {
                    return Err(malformed());
                }
                let version = decode_version(&rest[..2])?;
                let count = rest[2] as usize;
                let mut cursor = &rest[3..];
                let mut chain = Vec::with_capacity(count);
                for _ in 0..count {
                    if cursor.len() < 2 {
                        return Err(malformed());
                    }
                    let len = u16::from_be_bytes([cursor[0], cursor[1]]) as usize;
                    if cursor.len() < 2 + len {
                        return Err(malformed());
                    }
                    chain.push(Certificate::new(cursor[2..2 + len].to_vec()));
                    cursor = &cursor[2 + len..];
                }
                if !cursor.is_empty() {
                    return Err(malformed());
                }
                Ok(ServerHello::Accept { version, chain })
            }
            _ => Err(malformed()),
        }
    }
}
