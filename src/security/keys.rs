//! X25519 identities and raw-public-key certificates.

use std::fmt;
use std::sync::Arc;

use blake2::{Blake2s256, Digest};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use super::error::SecurityError;
use super::handshake::NOISE_PATTERN;
use crate::core::{HASH_SIZE, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

/// Most certificates a presented chain may hold, leaf included.
pub const MAX_CHAIN_LENGTH: usize = u8::MAX as usize;

/// Largest certificate a chain may carry.
pub const MAX_CERTIFICATE_SIZE: usize = u16::MAX as usize;

/// A static X25519 keypair for a long-term server identity.
///
/// The private key is zeroized on drop.
#[derive(Clone)]
pub struct StaticKeypair {
    private: [u8; PRIVATE_KEY_SIZE],
    public: [u8; PUBLIC_KEY_SIZE],
}

impl StaticKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, SecurityError> {
        let params = NOISE_PATTERN
            .parse()
            .map_err(|e: snow::Error| SecurityError::InvalidConfig(e.to_string()))?;
        let keypair = snow::Builder::new(params)
            .generate_keypair()
            .map_err(|e| SecurityError::InvalidConfig(e.to_string()))?;

        let mut private = [0u8; PRIVATE_KEY_SIZE];
        let mut public = [0u8; PUBLIC_KEY_SIZE];
        private.copy_from_slice(&keypair.private);
        public.copy_from_slice(&keypair.public);

        Ok(Self { private, public })
    }

    /// Rebuild a keypair from a stored private key.
    pub fn from_private(private: [u8; PRIVATE_KEY_SIZE]) -> Self {
        let public = PublicKey::from(&StaticSecret::from(private));
        Self {
            private,
            public: *public.as_bytes(),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.public
    }

    /// Get the private key.
    pub(crate) fn private_key(&self) -> &[u8; PRIVATE_KEY_SIZE] {
        &self.private
    }

    /// The raw-public-key certificate presented for this keypair.
    pub fn certificate(&self) -> Certificate {
        Certificate::new(self.public.to_vec())
    }
}

impl Drop for StaticKeypair {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.certificate().fingerprint_hex())
            .finish_non_exhaustive()
    }
}

/// Certificate bytes as exchanged during the handshake.
///
/// The leaf certificate of a chain is the responder's raw X25519 public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Certificate(Vec<u8>);

impl Certificate {
    /// Wrap certificate bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw certificate bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// BLAKE2s-256 fingerprint.
    pub fn fingerprint(&self) -> [u8; HASH_SIZE] {
        let digest = Blake2s256::digest(&self.0);
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&digest);
        out
    }

    /// Lowercase hex fingerprint, for logs and pinning UIs.
    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint().iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({})", self.fingerprint_hex())
    }
}

/// A server identity: its keypair plus any chain certificates presented
/// after the leaf.
#[derive(Clone, Debug)]
pub struct Identity {
    keypair: Arc<StaticKeypair>,
    chain: Vec<Certificate>,
}

impl Identity {
    /// Identity with a bare leaf certificate.
    pub fn new(keypair: StaticKeypair) -> Self {
        Self {
            keypair: Arc::new(keypair),
            chain: Vec::new(),
        }
    }

    /// Generate a fresh identity.
    pub fn generate() -> Result<Self, SecurityError> {
        StaticKeypair::generate().map(Self::new)
    }

    /// Append an issuer certificate to the presented chain.
    ///
    /// The chain, leaf included, holds at most 255 certificates of at most
    /// 65535 bytes each.
    pub fn with_chain_certificate(mut self, certificate: Certificate) -> Result<Self, SecurityError> {
        if certificate.as_bytes().len() > MAX_CERTIFICATE_SIZE {
            return Err(SecurityError::InvalidConfig(format!(
                "chain certificate of {} bytes exceeds {MAX_CERTIFICATE_SIZE}",
                certificate.as_bytes().len()
            )));
        }
        if 1 + self.chain.len() >= MAX_CHAIN_LENGTH {
            return Err(SecurityError::InvalidConfig(format!(
                "certificate chain longer than {MAX_CHAIN_LENGTH}"
            )));
        }
        self.chain.push(certificate);
        Ok(self)
    }

    /// The keypair.
    pub fn keypair(&self) -> &StaticKeypair {
        &self.keypair
    }

    /// The leaf certificate.
    pub fn certificate(&self) -> Certificate {
        self.keypair.certificate()
    }

    /// Full chain, leaf first.
    pub fn certificate_chain(&self) -> Vec<Certificate> {
        let mut chain = Vec::with_capacity(1 + self.chain.len());
        chain.push(self.certificate());
        chain.extend(self.chain.iter().cloned());
        chain
    }
}
