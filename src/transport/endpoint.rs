//! Remote endpoint descriptors and address resolution.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use super::error::TransportError;

/// Which kind of socket a connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    /// Ordered, reliable byte stream (TCP).
    #[default]
    Stream,
    /// Best-effort datagrams (UDP).
    Datagram,
}

impl TransportKind {
    /// DNS-SD protocol label (`_tcp` or `_udp`).
    pub fn service_protocol(self) -> &'static str {
        match self {
            TransportKind::Stream => "_tcp",
            TransportKind::Datagram => "_udp",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stream => f.write_str("stream"),
            TransportKind::Datagram => f.write_str("datagram"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "tcp" => Ok(TransportKind::Stream),
            "datagram" | "udp" => Ok(TransportKind::Datagram),
            other => Err(TransportError::Setup(format!("unknown transport kind: {other}"))),
        }
    }
}

/// Where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A host name or address literal plus a port.
    HostPort {
        /// Host name or IP literal.
        host: String,
        /// Port.
        port: u16,
    },
    /// An already resolved socket address.
    Socket(SocketAddr),
    /// A service found by local-network discovery.
    Service {
        /// Instance name, e.g. `Alice's Chat`.
        name: String,
        /// Service type token, e.g. `_peerchat._tcp`.
        service_type: String,
    },
}

impl Endpoint {
    /// Endpoint for `host:port`.
    pub fn host_port(host: impl Into<String>, port: u16) -> Self {
        Endpoint::HostPort {
            host: host.into(),
            port,
        }
    }

    /// Endpoint for a discovered service.
    pub fn service(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Endpoint::Service {
            name: name.into(),
            service_type: service_type.into(),
        }
    }

    /// Resolve to candidate socket addresses.
    ///
    /// Service endpoints need a resolver; without one they fail as a setup
    /// error.
    pub async fn resolve(
        &self,
        resolver: Option<&Arc<dyn ServiceResolver>>,
    ) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = match self {
            Endpoint::Socket(addr) => vec![*addr],
            Endpoint::HostPort { host, port } => tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(|e| TransportError::Setup(format!("cannot resolve {self}: {}", e.kind())))?
                .collect(),
            Endpoint::Service { name, service_type } => {
                let resolver = resolver.ok_or_else(|| {
                    TransportError::Setup(format!("no service resolver configured for {self}"))
                })?;
                resolver
                    .resolve(name, service_type)
                    .map_err(|e| TransportError::Setup(format!("cannot resolve {self}: {}", e.kind())))?
            }
        };

        if addrs.is_empty() {
            return Err(TransportError::Setup(format!("{self} resolved to no addresses")));
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::HostPort { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Endpoint::HostPort { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Socket(addr) => write!(f, "{addr}"),
            Endpoint::Service { name, service_type } => write!(f, "{name}.{service_type}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    /// Parses `ip:port`, `[v6]:port` or `host:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Setup(format!("missing port in {s:?}")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::Setup(format!("invalid port in {s:?}")))?;
        if host.is_empty() {
            return Err(TransportError::Setup(format!("missing host in {s:?}")));
        }
        Ok(Endpoint::host_port(host.trim_matches(['[', ']']), port))
    }
}

/// Resolves discovered service names to addresses.
///
/// Implemented by the external discovery component; the engine only calls it
/// when a connection targets [`Endpoint::Service`].
pub trait ServiceResolver: Send + Sync + fmt::Debug {
    /// Look up the addresses currently published for `name` of `service_type`.
    fn resolve(&self, name: &str, service_type: &str) -> io::Result<Vec<SocketAddr>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedResolver(SocketAddr);

    impl ServiceResolver for FixedResolver {
        fn resolve(&self, name: &str, _service_type: &str) -> io::Result<Vec<SocketAddr>> {
            if name == "known" {
                Ok(vec![self.0])
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "unknown service"))
            }
        }
    }

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            "127.0.0.1:9000".parse::<Endpoint>().unwrap(),
            Endpoint::Socket("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(
            "chat.local:7000".parse::<Endpoint>().unwrap(),
            Endpoint::host_port("chat.local", 7000)
        );
        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":80".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("udp".parse::<TransportKind>().unwrap(), TransportKind::Datagram);
        assert_eq!("Stream".parse::<TransportKind>().unwrap(), TransportKind::Stream);
        assert!("sctp".parse::<TransportKind>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addrs = Endpoint::host_port("localhost", 4000)
            .resolve(None)
            .await
            .unwrap();
        assert!(addrs.iter().all(|a| a.port() == 4000));
    }

    #[tokio::test]
    async fn test_resolve_service_needs_resolver() {
        let endpoint = Endpoint::service("known", "_peerchat._tcp");
        assert!(matches!(
            endpoint.resolve(None).await,
            Err(TransportError::Setup(_))
        ));

        let addr: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        let resolver: Arc<dyn ServiceResolver> = Arc::new(FixedResolver(addr));
        assert_eq!(endpoint.resolve(Some(&resolver)).await.unwrap(), vec![addr]);

        let missing = Endpoint::service("missing", "_peerchat._tcp");
        assert!(missing.resolve(Some(&resolver)).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_to_discovered_service() {
        use crate::core::ErrorKind;
        use crate::transport::{Connection, Parameters};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let resolver: Arc<dyn ServiceResolver> =
            Arc::new(FixedResolver(listener.local_addr().unwrap()));
        let params = Parameters::stream().resolver(resolver);

        let (conn, _events) =
            Connection::connect(Endpoint::service("known", "_peerchat._tcp"), params.clone());
        let (_accepted, _) = listener.accept().await.unwrap();
        conn.ready().await.unwrap();
        assert_eq!(conn.remote(), &Endpoint::service("known", "_peerchat._tcp"));

        let (missing, _events) =
            Connection::connect(Endpoint::service("missing", "_peerchat._tcp"), params);
        let failure = missing.ready().await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::TransportSetupFailed);
        assert!(!failure.description.contains("unknown service"));
    }
}
