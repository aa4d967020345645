//! Local-network service advertisement boundary.
//!
//! The server does not speak mDNS itself. It validates a
//! [`ServiceAdvertisement`], encodes its TXT record, and hands both to an
//! injected [`ServiceAdvertiser`] once the listener knows its port.

use std::collections::BTreeMap;
use std::fmt;
use std::io;

use super::server::ServerError;
use crate::transport::TransportKind;

/// Longest `key=value` TXT entry (one DNS character-string).
pub const MAX_TXT_ENTRY: usize = 255;

/// Longest service instance name (one DNS label).
pub const MAX_INSTANCE_NAME: usize = 63;

/// Longest application protocol name in a service type.
pub const MAX_SERVICE_NAME: usize = 15;

/// What the server publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvertisement {
    /// Instance name shown to browsers, e.g. `"alice's table"`.
    pub name: String,
    /// Service type token, e.g. `"_peerchat._tcp"`.
    pub service_type: String,
    /// Free-form attributes (username, version, status).
    pub txt: BTreeMap<String, String>,
}

impl ServiceAdvertisement {
    /// Create an advertisement without attributes.
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            txt: BTreeMap::new(),
        }
    }

    /// Add a TXT attribute.
    pub fn with_txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.txt.insert(key.into(), value.into());
        self
    }

    /// Check the advertisement against the transport it will describe.
    pub fn validate(&self, kind: TransportKind) -> Result<(), ServerError> {
        if self.name.is_empty() || self.name.len() > MAX_INSTANCE_NAME {
            return Err(invalid(format!(
                "instance name must be 1-{MAX_INSTANCE_NAME} bytes, got {}",
                self.name.len()
            )));
        }

        let Some((service, protocol)) = self.service_type.split_once('.') else {
            return Err(invalid(format!("malformed service type {:?}", self.service_type)));
        };
        let app = service.strip_prefix('_').unwrap_or_default();
        let app_ok = !app.is_empty()
            && app.len() <= MAX_SERVICE_NAME
            && app.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !app.starts_with('-')
            && !app.ends_with('-');
        if !service.starts_with('_') || !app_ok {
            return Err(invalid(format!("malformed service type {:?}", self.service_type)));
        }
        if protocol != kind.service_protocol() {
            return Err(invalid(format!(
                "service type {:?} does not match {kind} transport (expected {})",
                self.service_type,
                kind.service_protocol()
            )));
        }

        for (key, value) in &self.txt {
            if key.is_empty() || key.contains('=') || !key.is_ascii() {
                return Err(invalid(format!("invalid TXT key {key:?}")));
            }
            let len = key.len() + 1 + value.len();
            if len > MAX_TXT_ENTRY {
                return Err(invalid(format!(
                    "TXT entry {key:?} is {len} bytes, limit {MAX_TXT_ENTRY}"
                )));
            }
        }
        Ok(())
    }

    /// DNS-SD TXT record data: one length-prefixed `key=value` string per
    /// attribute, or a single empty string when there are none.
    ///
    /// Call [`validate`](Self::validate) first; oversized entries are
    /// truncated here.
    pub fn txt_record(&self) -> Vec<u8> {
        if self.txt.is_empty() {
            return vec![0];
        }
        let mut out = Vec::new();
        for (key, value) in &self.txt {
            let mut entry = format!("{key}={value}").into_bytes();
            entry.truncate(MAX_TXT_ENTRY);
            out.push(entry.len() as u8);
            out.extend_from_slice(&entry);
        }
        out
    }
}

impl fmt::Display for ServiceAdvertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.service_type)
    }
}

fn invalid(reason: String) -> ServerError {
    ServerError::InvalidAdvertisement(reason)
}

/// Publishes and withdraws service records (mDNS/DNS-SD responder).
pub trait ServiceAdvertiser: Send + Sync + fmt::Debug {
    /// Publish `advertisement` for the bound `port`.
    fn advertise(&self, advertisement: &ServiceAdvertisement, port: u16) -> io::Result<()>;

    /// Withdraw a previously published record.
    fn withdraw(&self, advertisement: &ServiceAdvertisement) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_matching_protocol() {
        let ad = ServiceAdvertisement::new("lobby", "_peerchat._tcp")
            .with_txt("username", "alice")
            .with_txt("version", "1");
        assert!(ad.validate(TransportKind::Stream).is_ok());
        assert!(ad.validate(TransportKind::Datagram).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_tokens() {
        for service_type in ["peerchat._tcp", "_._tcp", "_peer chat._tcp", "_waytoolongservicename._tcp", "_peerchat"] {
            let ad = ServiceAdvertisement::new("lobby", service_type);
            assert!(
                ad.validate(TransportKind::Stream).is_err(),
                "{service_type} should be rejected"
            );
        }
        assert!(ServiceAdvertisement::new("", "_peerchat._tcp")
            .validate(TransportKind::Stream)
            .is_err());
    }

    #[test]
    fn test_validate_txt_limits() {
        let ad = ServiceAdvertisement::new("lobby", "_game._udp").with_txt("a=b", "c");
        assert!(ad.validate(TransportKind::Datagram).is_err());

        let ad = ServiceAdvertisement::new("lobby", "_game._udp").with_txt("status", "x".repeat(248));
        assert!(ad.validate(TransportKind::Datagram).is_ok());
        let ad = ad.with_txt("status", "x".repeat(249));
        assert!(ad.validate(TransportKind::Datagram).is_err());
    }

    #[test]
    fn test_txt_record_wire_form() {
        let ad = ServiceAdvertisement::new("lobby", "_peerchat._tcp")
            .with_txt("user", "bob")
            .with_txt("v", "1");
        assert_eq!(ad.txt_record(), b"\x08user=bob\x03v=1");

        assert_eq!(ServiceAdvertisement::new("lobby", "_peerchat._tcp").txt_record(), [0]);
    }
}
