//! Chat/state relay server.
//!
//! Accepts inbound connections, registers each once it reaches `ready`,
//! and relays every received payload to all other registered
//! connections.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::advertise::{ServiceAdvertisement, ServiceAdvertiser};
use super::registry::ConnectionRegistry;
use crate::core::{
    Classify, DATAGRAM_PEER_QUEUE, DEFAULT_CLOSE_TIMEOUT, DEFAULT_DATAGRAM_IDLE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, ErrorKind, Failure, MAX_DATAGRAM_SIZE,
};
use crate::security::SecurityConfig;
use crate::transport::{
    Connection, ConnectionEvent, ConnectionEvents, ConnectionId, ConnectionState, Endpoint,
    Parameters, TransportError, TransportKind, cancelled,
};

/// Errors that can occur when starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("bind to {addr} failed: {}", .source.kind())]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: io::Error,
    },

    /// Inconsistent configuration.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    /// The service advertisement is malformed.
    #[error("invalid service advertisement: {0}")]
    InvalidAdvertisement(String),

    /// The advertiser refused the record.
    #[error("service advertisement failed: {0}")]
    Advertise(io::Error),
}

impl Classify for ServerError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::TransportSetupFailed
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to; port 0 picks any free port.
    pub bind_addr: SocketAddr,

    /// Parameters for accepted connections (transport kind, security,
    /// handshake timeout, keep-alive).
    pub parameters: Parameters,

    /// Maximum number of concurrent connections, registered or not.
    pub max_connections: usize,

    /// How long shutdown waits for close messages to be written.
    pub close_timeout: Duration,

    /// Relay received payloads to every other registered connection.
    pub relay: bool,

    /// Datagram transport only: a peer that sends nothing for this long
    /// fails with `ConnectionLost` and frees its slot.
    pub datagram_idle_timeout: Duration,

    /// Record published once the listener is ready.
    pub advertisement: Option<ServiceAdvertisement>,

    /// Collaborator publishing `advertisement`.
    pub advertiser: Option<Arc<dyn ServiceAdvertiser>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            parameters: Parameters::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            relay: true,
            datagram_idle_timeout: DEFAULT_DATAGRAM_IDLE_TIMEOUT,
            advertisement: None,
            advertiser: None,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::InvalidConfig("max_connections must be positive".into()));
        }
        if self.datagram_idle_timeout.is_zero() {
            return Err(ServerError::InvalidConfig(
                "datagram_idle_timeout must be positive".into(),
            ));
        }
        if let Some(security) = &self.parameters.security {
            if security.identity.is_none() {
                return Err(ServerError::InvalidConfig(
                    "a secure server needs an identity".into(),
                ));
            }
            security
                .validate()
                .map_err(|e| ServerError::InvalidConfig(e.to_string()))?;
        }
        match (&self.advertisement, &self.advertiser) {
            (Some(ad), Some(_)) => ad.validate(self.parameters.kind),
            (Some(_), None) => Err(ServerError::InvalidConfig(
                "an advertisement needs an advertiser".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Builder for creating a [`ServerConfig`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set only the port; 0 picks any free port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.bind_addr.set_port(port);
        self
    }

    /// Choose stream or datagram transport.
    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.parameters.kind = kind;
        self
    }

    /// Replace the parameters used for accepted connections.
    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.config.parameters = parameters;
        self
    }

    /// Secure every accepted connection.
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.parameters.security = Some(security);
        self
    }

    /// Send keep-alives on idle stream connections.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.config.parameters.keep_alive = Some(interval);
        self
    }

    /// Set the maximum number of concurrent connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the shutdown close timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Drop datagram peers that stay silent for `timeout`.
    pub fn datagram_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.datagram_idle_timeout = timeout;
        self
    }

    /// Enable or disable relaying.
    pub fn relay(mut self, enabled: bool) -> Self {
        self.config.relay = enabled;
        self
    }

    /// Advertise the server once it is listening.
    pub fn advertise(
        mut self,
        advertisement: ServiceAdvertisement,
        advertiser: Arc<dyn ServiceAdvertiser>,
    ) -> Self {
        self.config.advertisement = Some(advertisement);
        self.config.advertiser = Some(advertiser);
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Listener lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Bound and accepting on `port`.
    Ready {
        /// Actually bound port.
        port: u16,
    },
    /// The listening socket broke.
    Failed(Failure),
    /// Shut down.
    Cancelled,
}

/// Event from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A connection reached `ready` and was registered.
    Connected {
        /// Connection ID.
        id: ConnectionId,
        /// Peer address.
        remote: Endpoint,
    },

    /// A registered connection delivered a payload.
    MessageReceived {
        /// Sender.
        from: ConnectionId,
        /// Payload bytes.
        payload: Vec<u8>,
    },

    /// A registered connection left the registry.
    Disconnected {
        /// Connection ID.
        id: ConnectionId,
        /// Why, unless it was cancelled locally.
        failure: Option<Failure>,
    },
}

/// Receiving side of the server's event stream.
#[derive(Debug)]
pub struct ServerEvents {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl ServerEvents {
    /// Next event; `None` once the server and all its connections are gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose send completed.
    pub delivered: usize,
    /// Recipients that failed and were cancelled and removed.
    pub failed: Vec<ConnectionId>,
}

#[derive(Debug)]
struct Inner {
    config: ServerConfig,
    registry: ConnectionRegistry,
    events: mpsc::UnboundedSender<ServerEvent>,
    shutting_down: AtomicBool,
    closing: watch::Sender<bool>,
    live: AtomicUsize,
    relayed: AtomicU64,
}

/// A relay server.
///
/// Dropping the server cancels every connection and the listener without
/// sending close messages; call [`shutdown`](Self::shutdown) for a graceful
/// stop.
///
/// # Example
///
/// ```ignore
/// use peerlink::server::{Server, ServerBuilder, ServerEvent};
///
/// let config = ServerBuilder::new().port(0).build();
/// let (server, mut events) = Server::start(config).await?;
/// println!("listening on {}", server.local_port());
///
/// while let Some(event) = events.recv().await {
///     if let ServerEvent::Connected { id, .. } = event {
///         println!("{id} joined");
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Server {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    listener_state: watch::Receiver<ListenerState>,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Bind the listener and start accepting.
    ///
    /// A bind failure is reported here once and never retried.
    pub async fn start(config: ServerConfig) -> Result<(Self, ServerEvents), ServerError> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closing_tx, closing_rx) = watch::channel(false);
        let kind = config.parameters.kind;
        let bind_addr = config.bind_addr;

        let bound = match kind {
            TransportKind::Stream => TcpListener::bind(bind_addr).await.map(Listener::Stream),
            TransportKind::Datagram => UdpSocket::bind(bind_addr)
                .await
                .map(|s| Listener::Datagram(Arc::new(s))),
        };
        let listener = bound.map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: bind_addr,
            source,
        })?;

        if let (Some(ad), Some(advertiser)) = (&config.advertisement, &config.advertiser) {
            advertiser
                .advertise(ad, local_addr.port())
                .map_err(ServerError::Advertise)?;
            info!(service = %ad, port = local_addr.port(), "service advertised");
        }

        let inner = Arc::new(Inner {
            config,
            registry: ConnectionRegistry::new(),
            events: events_tx,
            shutting_down: AtomicBool::new(false),
            closing: closing_tx,
            live: AtomicUsize::new(0),
            relayed: AtomicU64::new(0),
        });

        let (state_tx, state_rx) = watch::channel(ListenerState::Ready {
            port: local_addr.port(),
        });
        info!(addr = %local_addr, transport = %kind, "server listening");

        let task = tokio::spawn(run_listener(Arc::clone(&inner), listener, state_tx, closing_rx));

        Ok((
            Self {
                inner,
                local_addr,
                listener_state: state_rx,
                listener_task: Mutex::new(Some(task)),
            },
            ServerEvents { rx: events_rx },
        ))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Actually bound port (useful after binding port 0).
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Current listener state.
    pub fn listener_state(&self) -> ListenerState {
        self.listener_state.borrow().clone()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Identifiers of the registered connections.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|entry| entry.id())
            .collect()
    }

    /// Payloads relayed to other connections so far.
    pub fn relayed_messages(&self) -> u64 {
        self.inner.relayed.load(Ordering::Relaxed)
    }

    /// Send `payload` to every registered connection except `except`.
    ///
    /// Connections registered after this call starts do not receive it. A
    /// failing recipient is cancelled and removed; the rest still receive
    /// the payload.
    pub async fn broadcast(&self, payload: &[u8], except: Option<ConnectionId>) -> BroadcastReport {
        self.inner.broadcast(payload, except, false).await
    }

    /// Send `payload` to one registered connection.
    pub async fn send_to(&self, id: ConnectionId, payload: &[u8]) -> Result<(), TransportError> {
        let entry = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .find(|entry| entry.id() == id)
            .ok_or(TransportError::NotReady {
                state: "unregistered",
            })?;
        entry.connection.send(payload.to_vec(), false).await
    }

    /// Cancel one connection.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        match self.inner.registry.remove(id) {
            Some(entry) => {
                entry.connection.cancel();
                true
            }
            None => false,
        }
    }

    /// Graceful stop: refuse new connections, send every registered
    /// connection a final message, cancel them all, withdraw the
    /// advertisement, then close the listener. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            self.closed().await;
            return;
        }
        info!(connections = self.inner.registry.len(), "server shutting down");

        let close_timeout = self.inner.config.close_timeout;
        let closing = self.inner.broadcast(&[], None, true);
        if timeout(close_timeout, closing).await.is_err() {
            warn!(?close_timeout, "close messages did not complete in time");
        }

        for entry in self.inner.registry.drain() {
            entry.connection.cancel();
        }

        self.inner.withdraw_advertisement();
        self.inner.closing.send_replace(true);

        let task = self
            .listener_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("server stopped");
    }

    /// Wait until the listener is closed.
    pub async fn closed(&self) {
        let mut state = self.listener_state.clone();
        let _ = state
            .wait_for(|s| !matches!(s, ListenerState::Ready { .. }))
            .await;
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.inner.registry.drain() {
            entry.connection.cancel();
        }
        self.inner.withdraw_advertisement();
        self.inner.closing.send_replace(true);
    }
}

impl Inner {
    async fn broadcast(
        &self,
        payload: &[u8],
        except: Option<ConnectionId>,
        is_final: bool,
    ) -> BroadcastReport {
        let recipients: Vec<Connection> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|entry| Some(entry.id()) != except)
            .map(|entry| entry.connection)
            .collect();

        let mut report = BroadcastReport::default();
        let mut pending = Vec::with_capacity(recipients.len());
        for connection in recipients {
            match connection.enqueue(payload.to_vec(), is_final) {
                Ok(send) => pending.push((connection, send)),
                Err(e) => self.drop_recipient(&connection, &e, &mut report),
            }
        }
        for (connection, send) in pending {
            match send.wait().await {
                Ok(()) => report.delivered += 1,
                Err(e) => self.drop_recipient(&connection, &e, &mut report),
            }
        }
        report
    }

    fn drop_recipient(&self, connection: &Connection, error: &TransportError, report: &mut BroadcastReport) {
        warn!(connection = %connection.id(), error = %error, "broadcast recipient failed");
        connection.cancel();
        self.registry.remove(connection.id());
        report.failed.push(connection.id());
    }

    fn withdraw_advertisement(&self) {
        if let (Some(ad), Some(advertiser)) = (&self.config.advertisement, &self.config.advertiser) {
            match advertiser.withdraw(ad) {
                Ok(()) => debug!(service = %ad, "service withdrawn"),
                Err(e) => warn!(service = %ad, error = %e, "service withdrawal failed"),
            }
        }
    }

    /// Reserve a connection slot, unless shutting down or full.
    fn admit(&self, peer: SocketAddr) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(%peer, "refusing connection during shutdown");
            return false;
        }
        let max = self.config.max_connections;
        let admitted = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            })
            .is_ok();
        if !admitted {
            warn!(%peer, max, "connection limit reached");
        }
        admitted
    }
}

enum Listener {
    Stream(TcpListener),
    Datagram(Arc<UdpSocket>),
}

impl Listener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Listener::Stream(listener) => listener.local_addr(),
            Listener::Datagram(socket) => socket.local_addr(),
        }
    }
}

async fn run_listener(
    inner: Arc<Inner>,
    listener: Listener,
    state: watch::Sender<ListenerState>,
    mut closing: watch::Receiver<bool>,
) {
    let outcome = match listener {
        Listener::Stream(listener) => accept_streams(&inner, listener, &mut closing).await,
        Listener::Datagram(socket) => demux_datagrams(&inner, socket, &mut closing).await,
    };
    match outcome {
        Ok(()) => {
            state.send_replace(ListenerState::Cancelled);
        }
        Err(e) => {
            let failure = Failure::from_error(&TransportError::Io(e));
            warn!(error = %failure, "listener failed");
            state.send_replace(ListenerState::Failed(failure));
        }
    }
}

async fn accept_streams(
    inner: &Arc<Inner>,
    listener: TcpListener,
    closing: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancelled(closing) => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if !inner.admit(peer) {
                    continue;
                }
                info!(%peer, "accepted connection");
                let (connection, events) =
                    Connection::accept_stream(stream, peer, inner.config.parameters.clone());
                tokio::spawn(supervise(Arc::clone(inner), connection, events));
            }
            // Per-connection accept errors (reset before accept, fd limits)
            // do not take the listener down.
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn demux_datagrams(
    inner: &Arc<Inner>,
    socket: Arc<UdpSocket>,
    closing: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let (released_tx, mut released) = mpsc::unbounded_channel::<SocketAddr>();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            biased;
            _ = cancelled(closing) => return Ok(()),
            Some(peer) = released.recv() => {
                // Only forget the association that ended, not a newer one.
                if peers.get(&peer).is_some_and(|tx| tx.is_closed()) {
                    peers.remove(&peer);
                    trace!(%peer, "datagram peer released");
                }
                continue;
            }
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, peer) = match received {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                trace!(error = %e, "ignoring datagram socket error");
                continue;
            }
            Err(e) => return Err(e),
        };
        let datagram = buf[..n].to_vec();

        // Forget peers whose connection has ended; their next datagram
        // starts a new association.
        if let Some(tx) = peers.get(&peer) {
            if tx.is_closed() {
                peers.remove(&peer);
            }
        }

        match peers.entry(peer) {
            Entry::Occupied(entry) => {
                if entry.get().try_send(datagram).is_err() {
                    trace!(%peer, "peer queue full, dropping datagram");
                }
            }
            Entry::Vacant(entry) => {
                if !inner.admit(peer) {
                    continue;
                }
                info!(%peer, "new datagram peer");
                let (tx, rx) = mpsc::channel(DATAGRAM_PEER_QUEUE);
                let _ = tx.try_send(datagram);
                entry.insert(tx);
                let (connection, events) = Connection::accept_datagram(
                    Arc::clone(&socket),
                    peer,
                    rx,
                    inner.config.datagram_idle_timeout,
                    inner.config.parameters.clone(),
                );
                let inner = Arc::clone(inner);
                let released = released_tx.clone();
                tokio::spawn(async move {
                    supervise(inner, connection, events).await;
                    let _ = released.send(peer);
                });
            }
        }
    }
}

/// Follows one accepted connection: registers it on `ready`, relays its
/// messages, and unregisters it when it ends.
async fn supervise(inner: Arc<Inner>, connection: Connection, mut events: ConnectionEvents) {
    let id = connection.id();
    let mut closing = inner.closing.subscribe();
    let mut closed = false;
    let mut registered = false;

    loop {
        let event = tokio::select! {
            biased;
            _ = cancelled(&mut closing), if !closed => {
                closed = true;
                connection.cancel();
                continue;
            }
            event = events.recv() => event,
        };
        let Some(event) = event else { break };

        match event {
            ConnectionEvent::State(ConnectionState::Ready) => {
                if inner.shutting_down.load(Ordering::SeqCst) {
                    connection.cancel();
                    continue;
                }
                registered = inner.registry.add(connection.clone());
                if registered {
                    let _ = inner.events.send(ServerEvent::Connected {
                        id,
                        remote: connection.remote().clone(),
                    });
                }
            }
            ConnectionEvent::State(ConnectionState::Failed(failure)) => {
                debug!(connection = %id, error = %failure, "connection failed");
                if registered && inner.registry.remove(id).is_some() {
                    let _ = inner.events.send(ServerEvent::Disconnected {
                        id,
                        failure: Some(failure),
                    });
                }
                registered = false;
                connection.cancel();
            }
            ConnectionEvent::State(ConnectionState::Cancelled) => {
                if registered && inner.registry.remove(id).is_some() {
                    let _ = inner.events.send(ServerEvent::Disconnected { id, failure: None });
                }
                registered = false;
            }
            ConnectionEvent::State(other) => trace!(connection = %id, state = %other, "state"),
            ConnectionEvent::Message(message) => {
                // An empty final message only marks the close.
                if message.payload.is_empty() && message.is_final {
                    continue;
                }
                if inner.config.relay {
                    let report = inner.broadcast(&message.payload, Some(id), false).await;
                    inner
                        .relayed
                        .fetch_add(report.delivered as u64, Ordering::Relaxed);
                }
                let _ = inner.events.send(ServerEvent::MessageReceived {
                    from: id,
                    payload: message.payload,
                });
            }
        }
    }

    if registered {
        inner.registry.remove(id);
    }
    inner.live.fetch_sub(1, Ordering::SeqCst);
    debug!(connection = %id, "connection released");
}
