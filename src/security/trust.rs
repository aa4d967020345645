//! Certificate verification policies.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::error::SecurityError;
use super::keys::Certificate;
use crate::core::HASH_SIZE;

/// Pluggable certificate chain verification.
///
/// `chain` is leaf first. Returning an error aborts the handshake.
pub trait CertificateVerifier: Send + Sync + fmt::Debug {
    /// Accept or reject the presented chain.
    fn verify(&self, chain: &[Certificate]) -> Result<(), SecurityError>;
}

/// A set of trusted certificates, matched by fingerprint.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: HashSet<[u8; HASH_SIZE]>,
}

impl TrustStore {
    /// Empty store; trusts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store trusting exactly the given certificates.
    pub fn from_certificates(certs: impl IntoIterator<Item = Certificate>) -> Self {
        let mut store = Self::new();
        for cert in certs {
            store.add(&cert);
        }
        store
    }

    /// Load every regular file in `dir` as one trusted certificate.
    pub fn load_dir(dir: impl AsRef<Path>) -> io::Result<Self> {
        let mut store = Self::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                store.add(&Certificate::new(fs::read(entry.path())?));
            }
        }
        Ok(store)
    }

    /// Trust one more certificate.
    pub fn add(&mut self, cert: &Certificate) {
        self.anchors.insert(cert.fingerprint());
    }

    /// Number of trusted certificates.
    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    /// Whether the store trusts nothing.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Whether this exact certificate is trusted.
    pub fn contains(&self, cert: &Certificate) -> bool {
        self.anchors.contains(&cert.fingerprint())
    }
}

/// Which certificates a client accepts.
#[derive(Clone)]
pub enum TrustPolicy {
    /// Accept chains containing a certificate from the store.
    System(TrustStore),
    /// Accept only a leaf byte-identical to the pinned certificate.
    Pinned(Certificate),
    /// Delegate to a custom verifier.
    Custom(Arc<dyn CertificateVerifier>),
    /// Accept anything. Development builds only; absent from release builds.
    #[cfg(debug_assertions)]
    InsecureDevOnly,
}

impl TrustPolicy {
    /// Short policy name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            TrustPolicy::System(_) => "system",
            TrustPolicy::Pinned(_) => "pinned",
            TrustPolicy::Custom(_) => "custom",
            #[cfg(debug_assertions)]
            TrustPolicy::InsecureDevOnly => "insecure-dev-only",
        }
    }
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy::System(TrustStore::new())
    }
}

impl fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPolicy::System(store) => write!(f, "System({} anchors)", store.len()),
            TrustPolicy::Pinned(cert) => write!(f, "Pinned({cert:?})"),
            TrustPolicy::Custom(verifier) => write!(f, "Custom({verifier:?})"),
            #[cfg(debug_assertions)]
            TrustPolicy::InsecureDevOnly => f.write_str("InsecureDevOnly"),
        }
    }
}

impl CertificateVerifier for TrustPolicy {
    fn verify(&self, chain: &[Certificate]) -> Result<(), SecurityError> {
        let leaf = chain
            .first()
            .ok_or_else(|| SecurityError::CertificateRejected("empty certificate chain".into()))?;

        match self {
            TrustPolicy::System(store) => {
                if chain.iter().any(|cert| store.contains(cert)) {
                    Ok(())
                } else {
                    Err(SecurityError::CertificateRejected(format!(
                        "no trusted certificate in chain (leaf {})",
                        leaf.fingerprint_hex()
                    )))
                }
            }
            TrustPolicy::Pinned(pinned) => {
                if leaf.as_bytes() == pinned.as_bytes() {
                    Ok(())
                } else {
                    Err(SecurityError::CertificateRejected(format!(
                        "leaf {} does not match pinned {}",
                        leaf.fingerprint_hex(),
                        pinned.fingerprint_hex()
                    )))
                }
            }
            TrustPolicy::Custom(verifier) => verifier.verify(chain),
            #[cfg(debug_assertions)]
            TrustPolicy::InsecureDevOnly => {
                tracing::warn!(
                    leaf = %leaf.fingerprint_hex(),
                    "accepting certificate without verification (insecure-dev-only)"
                );
                Ok(())
            }
        }
    }
}
