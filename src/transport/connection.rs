//! Connection handle and its driver task.
//!
//! Every connection is owned by one spawned driver task, the only writer of
//! its [`ConnectionState`]. Handles talk to the driver through a command
//! channel and observe it through a watch channel plus an event stream.
//!
//! Once `ready`, a separate reader task re-arms the socket read after every
//! completed frame while the driver serializes writes.

use std::fmt;
use std::future::pending;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, trace};

use super::endpoint::{Endpoint, ServiceResolver, TransportKind};
use super::error::TransportError;
use super::frame::{FrameFlags, FrameType};
use super::link::{self, FrameReader, FrameWriter};
use super::state::ConnectionState;
use super::stats::{TransferSnapshot, TransferStats};
use crate::core::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_WAITING_RETRY_INTERVAL,
    DEFAULT_WAITING_RETRY_LIMIT, FRAME_HEADER_SIZE, Failure, MAX_DATAGRAM_SIZE,
};
use crate::security::layer::{self as secure, Inbound, RecordReader, RecordWriter};
use crate::security::{RECORD_OVERHEAD, SecurityConfig, SecurityMetadata};

/// Unique identifier of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a random identifier.
    pub fn generate() -> Self {
        Self(OsRng.next_u64())
    }

    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Stream or datagram.
    pub kind: TransportKind,
    /// Bound on the whole negotiation, `waiting` retries included.
    pub connect_timeout: Duration,
    /// Pause in `waiting` before going back to `preparing`.
    pub waiting_retry_interval: Duration,
    /// Transient connect failures tolerated before `failed`.
    pub waiting_retry_limit: u32,
    /// Largest frame accepted on a stream, header included.
    pub max_frame_size: usize,
    /// Idle interval after which a stream sends a keep-alive frame.
    pub keep_alive: Option<Duration>,
    /// Enables the secure decorator.
    pub security: Option<SecurityConfig>,
    /// Resolves [`Endpoint::Service`] targets.
    pub resolver: Option<Arc<dyn ServiceResolver>>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            kind: TransportKind::Stream,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            waiting_retry_interval: DEFAULT_WAITING_RETRY_INTERVAL,
            waiting_retry_limit: DEFAULT_WAITING_RETRY_LIMIT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            keep_alive: None,
            security: None,
            resolver: None,
        }
    }
}

impl Parameters {
    /// Stream (TCP) parameters.
    pub fn stream() -> Self {
        Self::default()
    }

    /// Datagram (UDP) parameters.
    pub fn datagram() -> Self {
        Self {
            kind: TransportKind::Datagram,
            ..Self::default()
        }
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the `waiting` retry interval and limit.
    pub fn waiting_retry(mut self, interval: Duration, limit: u32) -> Self {
        self.waiting_retry_interval = interval;
        self.waiting_retry_limit = limit;
        self
    }

    /// Set the maximum stream frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Enable keep-alives (stream only).
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = Some(interval);
        self
    }

    /// Enable the secure decorator.
    pub fn security(mut self, config: SecurityConfig) -> Self {
        self.security = Some(config);
        self
    }

    /// Set the service resolver.
    pub fn resolver(mut self, resolver: Arc<dyn ServiceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Largest payload one `send` accepts.
    pub fn max_payload(&self) -> usize {
        let frame_limit = match self.kind {
            TransportKind::Stream => self.max_frame_size,
            TransportKind::Datagram => MAX_DATAGRAM_SIZE,
        };
        let overhead = FRAME_HEADER_SIZE
            + if self.security.is_some() {
                RECORD_OVERHEAD
            } else {
                0
            };
        frame_limit.saturating_sub(overhead)
    }
}

/// One delivered application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// The sender will not send anything after this.
    pub is_final: bool,
}

/// Everything a connection reports to its owner, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The state changed.
    State(ConnectionState),
    /// A message arrived.
    Message(Message),
}

/// Receiving side of a connection's event stream.
#[derive(Debug)]
pub struct ConnectionEvents {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionEvents {
    /// Next event; `None` once the driver has finished and all events
    /// were delivered.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

enum Command {
    Send {
        payload: Vec<u8>,
        is_final: bool,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
}

/// Completion report of one enqueued send.
#[derive(Debug)]
#[must_use = "a pending send reports nothing unless awaited"]
pub struct PendingSend {
    rx: oneshot::Receiver<Result<(), TransportError>>,
}

impl PendingSend {
    /// Wait for the send to reach the socket or fail.
    pub async fn wait(self) -> Result<(), TransportError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(TransportError::ConnectionLost(
                "connection ended before the send completed".into(),
            ))
        })
    }
}

#[derive(Debug)]
struct Shared {
    id: ConnectionId,
    kind: TransportKind,
    remote: Endpoint,
    max_payload: usize,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: watch::Sender<bool>,
    stats: Arc<TransferStats>,
    security: Arc<OnceLock<SecurityMetadata>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Send {
                payload, is_final, ..
            } => f
                .debug_struct("Send")
                .field("len", &payload.len())
                .field("is_final", is_final)
                .finish(),
        }
    }
}

/// Handle to one connection. Cheap to clone; all clones share the driver.
///
/// Dropping the last handle cancels the connection.
#[derive(Debug, Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

enum Origin {
    Connect(Endpoint),
    AcceptedStream(Option<TcpStream>),
    AcceptedDatagram(Option<(FrameWriter, FrameReader)>),
}

impl Connection {
    /// Start connecting to `endpoint`. Returns at once; progress arrives as
    /// [`ConnectionEvent::State`] events.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn connect(endpoint: Endpoint, params: Parameters) -> (Connection, ConnectionEvents) {
        let remote = endpoint.clone();
        Self::spawn(remote, params, Origin::Connect(endpoint))
    }

    /// Wrap a stream accepted by a listener.
    pub(crate) fn accept_stream(
        stream: TcpStream,
        peer: SocketAddr,
        params: Parameters,
    ) -> (Connection, ConnectionEvents) {
        Self::spawn(
            Endpoint::Socket(peer),
            params,
            Origin::AcceptedStream(Some(stream)),
        )
    }

    /// Wrap one peer of a shared datagram listener. The connection fails
    /// once `idle` passes without a datagram from the peer.
    pub(crate) fn accept_datagram(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbound: mpsc::Receiver<Vec<u8>>,
        idle: Duration,
        params: Parameters,
    ) -> (Connection, ConnectionEvents) {
        let halves = link::demuxed_datagram_halves(socket, peer, inbound, idle);
        Self::spawn(
            Endpoint::Socket(peer),
            params,
            Origin::AcceptedDatagram(Some(halves)),
        )
    }

    fn spawn(remote: Endpoint, params: Parameters, origin: Origin) -> (Connection, ConnectionEvents) {
        let id = ConnectionId::generate();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Setup);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stats = Arc::new(TransferStats::new());
        let security = Arc::new(OnceLock::new());

        let shared = Arc::new(Shared {
            id,
            kind: params.kind,
            remote,
            max_payload: params.max_payload(),
            state: state_rx,
            commands: commands_tx,
            cancel: cancel_tx,
            stats: Arc::clone(&stats),
            security: Arc::clone(&security),
        });

        let driver = Driver {
            id,
            params,
            origin,
            state: state_tx,
            events: events_tx,
            commands: commands_rx,
            cancel: cancel_rx,
            stats,
            security,
        };
        tokio::spawn(driver.run());

        (Connection { shared }, ConnectionEvents { rx: events_rx })
    }

    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Stream or datagram.
    pub fn kind(&self) -> TransportKind {
        self.shared.kind
    }

    /// Where this connection goes (or came from).
    pub fn remote(&self) -> &Endpoint {
        &self.shared.remote
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// A receiver observing state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Negotiated security, once the handshake completed.
    pub fn security(&self) -> Option<SecurityMetadata> {
        self.shared.security.get().cloned()
    }

    /// Transfer counters.
    pub fn stats(&self) -> TransferSnapshot {
        self.shared.stats.snapshot()
    }

    /// Largest payload one send accepts.
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    /// Wait until `ready`, or return why it never will be.
    pub async fn ready(&self) -> Result<(), Failure> {
        let mut state = self.shared.state.clone();
        let result = state
            .wait_for(|s| s.is_ready() || s.is_terminal())
            .await
            .map(|s| (*s).clone());
        match result {
            Ok(ConnectionState::Ready) => Ok(()),
            Ok(ConnectionState::Failed(failure)) => Err(failure),
            _ => Err(Failure::from_error(&TransportError::Cancelled)),
        }
    }

    /// Queue a payload and return its completion report.
    ///
    /// Fails fast outside `ready` or when the payload cannot fit one frame.
    pub fn enqueue(&self, payload: Vec<u8>, is_final: bool) -> Result<PendingSend, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.push(payload, is_final, Some(tx))?;
        Ok(PendingSend { rx })
    }

    /// Send a payload and wait for it to reach the socket.
    ///
    /// On a stream the payload is framed; on a datagram connection it is
    /// one independent datagram with no delivery or ordering guarantee.
    pub async fn send(&self, payload: Vec<u8>, is_final: bool) -> Result<(), TransportError> {
        self.enqueue(payload, is_final)?.wait().await
    }

    /// Fire-and-forget send: every failure, including `not ready`, is
    /// discarded. Opt-in; prefer [`send`](Self::send).
    pub fn send_idempotent(&self, payload: Vec<u8>) {
        if let Err(e) = self.push(payload, false, None) {
            trace!(connection = %self.shared.id, error = %e, "idempotent send dropped");
        }
    }

    fn push(
        &self,
        payload: Vec<u8>,
        is_final: bool,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    ) -> Result<(), TransportError> {
        {
            let state = self.shared.state.borrow();
            if !state.is_ready() {
                return Err(TransportError::NotReady {
                    state: state.name(),
                });
            }
        }
        if payload.len() > self.shared.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                max: self.shared.max_payload,
            });
        }

        self.shared
            .commands
            .send(Command::Send {
                payload,
                is_final,
                reply,
            })
            .map_err(|_| TransportError::ConnectionLost("connection driver stopped".into()))
    }

    /// Cancel from any state. Idempotent.
    ///
    /// Unblocks the receive loop and completes queued sends with a
    /// cancellation error.
    pub fn cancel(&self) {
        self.shared.cancel.send_replace(true);
    }
}

/// Resolves once `rx` carries `true` or every sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancel| *cancel).await;
}

/// Why the ready phase ended.
enum Exit {
    Cancelled,
    Lost(TransportError),
}

enum Step {
    Cancel,
    ReaderEnded(Result<Result<(), TransportError>, tokio::task::JoinError>),
    Command(Option<Command>),
    ResendHandshake,
    KeepAlive,
}

struct Driver {
    id: ConnectionId,
    params: Parameters,
    origin: Origin,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: watch::Receiver<bool>,
    stats: Arc<TransferStats>,
    security: Arc<OnceLock<SecurityMetadata>>,
}

impl Driver {
    async fn run(mut self) {
        let mut cancel = self.cancel.clone();
        self.transition(ConnectionState::Preparing);

        let connect_timeout = self.params.connect_timeout;
        let established = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            result = timeout(connect_timeout, self.establish()) => Some(result),
        };

        let exit = match established {
            None => Exit::Cancelled,
            Some(Err(_elapsed)) => Exit::Lost(TransportError::ConnectTimeout(connect_timeout)),
            Some(Ok(Err(e))) => Exit::Lost(e),
            Some(Ok(Ok((writer, reader)))) => self.run_ready(writer, reader).await,
        };

        match exit {
            Exit::Cancelled => {
                self.transition(ConnectionState::Cancelled);
                self.drain(|| TransportError::Cancelled);
            }
            Exit::Lost(e) => {
                let failure = Failure::from_error(&e);
                info!(connection = %self.id, error = %failure, "connection failed");
                self.transition(ConnectionState::Failed(failure));
                self.drain(|| TransportError::ConnectionLost("connection failed".into()));
                self.linger().await;
                self.transition(ConnectionState::Cancelled);
            }
        }
    }

    /// After `failed`, reject late commands until cancelled or abandoned.
    async fn linger(&mut self) {
        let mut cancel = self.cancel.clone();
        loop {
            let command = tokio::select! {
                _ = cancelled(&mut cancel) => return,
                command = self.commands.recv() => command,
            };
            match command {
                Some(Command::Send { reply, .. }) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(TransportError::NotReady { state: "failed" }));
                    }
                }
                None => return,
            }
        }
    }

    fn drain(&mut self, error: impl Fn() -> TransportError) {
        while let Ok(Command::Send { reply, .. }) = self.commands.try_recv() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(error()));
            }
        }
    }

    /// Single writer of the published state. Illegal transitions are
    /// logged and ignored.
    fn transition(&self, next: ConnectionState) -> bool {
        let current = self.state.borrow().clone();
        if !current.can_transition_to(&next) {
            debug!(connection = %self.id, from = %current, to = %next, "ignoring invalid transition");
            return false;
        }
        debug!(connection = %self.id, from = %current, to = %next, "state transition");
        self.state.send_replace(next.clone());
        let _ = self.events.send(ConnectionEvent::State(next));
        true
    }

    async fn establish(&mut self) -> Result<(RecordWriter, RecordReader), TransportError> {
        let mut failures = 0;
        loop {
            match self.attempt().await {
                Ok(link) => return Ok(link),
                Err(e) if e.is_transient() && failures < self.params.waiting_retry_limit => {
                    failures += 1;
                    debug!(connection = %self.id, error = %e, attempt = failures, "transient connect failure");
                    self.transition(ConnectionState::Waiting(Failure::from_error(&e)));
                    sleep(self.params.waiting_retry_interval).await;
                    self.transition(ConnectionState::Preparing);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&mut self) -> Result<(RecordWriter, RecordReader), TransportError> {
        let kind = self.params.kind;
        let (writer, reader, initiator) = match &mut self.origin {
            Origin::Connect(endpoint) => {
                let addrs = endpoint.resolve(self.params.resolver.as_ref()).await?;
                let (w, r) = match kind {
                    TransportKind::Stream => {
                        let stream = connect_stream(&addrs).await?;
                        link::stream_halves(stream, self.params.max_frame_size)
                    }
                    TransportKind::Datagram => {
                        link::connected_datagram_halves(connect_datagram(addrs[0]).await?)
                    }
                };
                (w, r, true)
            }
            Origin::AcceptedStream(stream) => {
                let stream = stream
                    .take()
                    .ok_or_else(|| TransportError::ConnectionLost("accepted stream already used".into()))?;
                let (w, r) = link::stream_halves(stream, self.params.max_frame_size);
                (w, r, false)
            }
            Origin::AcceptedDatagram(halves) => {
                let (w, r) = halves
                    .take()
                    .ok_or_else(|| TransportError::ConnectionLost("accepted peer already used".into()))?;
                (w, r, false)
            }
        };

        match &self.params.security {
            None => Ok((RecordWriter::plain(writer), RecordReader::plain(reader, kind))),
            Some(config) => {
                let (w, r, metadata) = if initiator {
                    secure::initiate(writer, reader, config, kind).await?
                } else {
                    secure::respond(writer, reader, config, kind).await?
                };
                let _ = self.security.set(metadata);
                Ok((w, r))
            }
        }
    }

    async fn run_ready(&mut self, mut writer: RecordWriter, reader: RecordReader) -> Exit {
        if !self.transition(ConnectionState::Ready) {
            return Exit::Cancelled;
        }
        info!(connection = %self.id, "connection ready");

        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let mut reader_task = tokio::spawn(receive_loop(
            self.id,
            reader,
            self.events.clone(),
            Arc::clone(&self.stats),
            retry_tx,
        ));

        let keep_alive = match self.params.kind {
            TransportKind::Stream => self.params.keep_alive,
            TransportKind::Datagram => None,
        };
        let mut last_write = Instant::now();
        let mut cancel = self.cancel.clone();

        let exit = loop {
            let deadline = keep_alive.map(|interval| last_write + interval);
            let idle = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            let step = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => Step::Cancel,
                ended = &mut reader_task => Step::ReaderEnded(ended),
                command = self.commands.recv() => Step::Command(command),
                Some(()) = retry_rx.recv() => Step::ResendHandshake,
                _ = idle => Step::KeepAlive,
            };

            match step {
                Step::Cancel | Step::Command(None) => break Exit::Cancelled,
                Step::ReaderEnded(Ok(Ok(()))) => break Exit::Lost(TransportError::ClosedByPeer),
                Step::ReaderEnded(Ok(Err(e))) => break Exit::Lost(e),
                Step::ReaderEnded(Err(e)) => {
                    break Exit::Lost(TransportError::ConnectionLost(format!("receive task ended: {e}")));
                }
                Step::Command(Some(Command::Send {
                    payload,
                    is_final,
                    reply,
                })) => {
                    let len = payload.len();
                    let flags = if is_final {
                        FrameFlags::NONE.with_final()
                    } else {
                        FrameFlags::NONE
                    };
                    let result = writer.send(FrameType::Data, flags, payload).await;
                    last_write = Instant::now();

                    match result {
                        Ok(()) => {
                            self.stats.record_sent(len);
                            if let Some(reply) = reply {
                                let _ = reply.send(Ok(()));
                            }
                        }
                        Err(e) if e.is_fatal() => {
                            if let Some(reply) = reply {
                                let _ = reply.send(Err(TransportError::ConnectionLost(e.to_string())));
                            }
                            break Exit::Lost(e);
                        }
                        Err(e) => {
                            debug!(connection = %self.id, error = %e, "send failed");
                            if let Some(reply) = reply {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                }
                Step::ResendHandshake => {
                    if let Err(e) = writer.resend_handshake_reply().await {
                        debug!(connection = %self.id, error = %e, "handshake reply resend failed");
                    }
                }
                Step::KeepAlive => {
                    trace!(connection = %self.id, "sending keep-alive");
                    let result = writer.send(FrameType::KeepAlive, FrameFlags::NONE, Vec::new()).await;
                    last_write = Instant::now();
                    if let Err(e) = result {
                        if e.is_fatal() {
                            break Exit::Lost(e);
                        }
                    }
                }
            }
        };

        reader_task.abort();
        exit
    }
}

/// Reader task: delivers messages until the peer finishes or the socket
/// fails. `Ok(())` means the peer closed (end of stream or a final message).
async fn receive_loop(
    id: ConnectionId,
    mut reader: RecordReader,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    stats: Arc<TransferStats>,
    retry: mpsc::UnboundedSender<()>,
) -> Result<(), TransportError> {
    loop {
        match reader.recv().await? {
            Some(Inbound::Data { payload, is_final }) => {
                stats.record_received(payload.len());
                let _ = events.send(ConnectionEvent::Message(Message { payload, is_final }));
                if is_final {
                    debug!(connection = %id, "peer sent final message");
                    return Ok(());
                }
            }
            Some(Inbound::KeepAlive) => trace!(connection = %id, "keep-alive received"),
            Some(Inbound::HandshakeRetry) => {
                let _ = retry.send(());
            }
            None => return Ok(()),
        }
    }
}

async fn connect_stream(addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                trace!(%addr, error = %e, "connect attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => TransportError::Io(e),
        None => TransportError::Setup("no addresses to connect to".into()),
    })
}

async fn connect_datagram(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let local: SocketAddr = if addr.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| TransportError::Setup(format!("cannot bind datagram socket: {}", e.kind())))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| TransportError::Setup(format!("cannot target {addr}: {}", e.kind())))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::transport::frame::{Frame, FrameDecoder};

    async fn next_state(events: &mut ConnectionEvents) -> ConnectionState {
        loop {
            match events.recv().await.expect("event stream ended") {
                ConnectionEvent::State(state) => return state,
                ConnectionEvent::Message(_) => continue,
            }
        }
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::from(0xABCD).to_string(), "000000000000abcd");
    }

    #[test]
    fn test_max_payload_accounts_for_overhead() {
        let plain = Parameters::stream().max_frame_size(1000);
        assert_eq!(plain.max_payload(), 998);

        let secure = plain.security(SecurityConfig::default());
        assert_eq!(secure.max_payload(), 998 - RECORD_OVERHEAD);

        assert_eq!(Parameters::datagram().max_payload(), MAX_DATAGRAM_SIZE - 2);
    }

    #[tokio::test]
    async fn test_stream_lifecycle_and_framing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (conn, mut events) = Connection::connect(addr.into(), Parameters::stream());
        let (mut peer, _) = listener.accept().await.unwrap();

        assert_eq!(next_state(&mut events).await, ConnectionState::Preparing);
        assert_eq!(next_state(&mut events).await, ConnectionState::Ready);

        conn.send(b"hello".to_vec(), false).await.unwrap();
        conn.send(b"world".to_vec(), true).await.unwrap();

        let mut decoder = FrameDecoder::new(1024);
        let mut frames = Vec::new();
        let mut buf = [0u8; 256];
        while frames.len() < 2 {
            let n = peer.read(&mut buf).await.unwrap();
            decoder.push(&buf[..n]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames[0], Frame::data(b"hello".to_vec(), false));
        assert_eq!(frames[1], Frame::data(b"world".to_vec(), true));

        let stats = conn.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.bytes_sent, 10);

        conn.cancel();
        conn.cancel();
        assert_eq!(next_state(&mut events).await, ConnectionState::Cancelled);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_idle_stream_sends_keep_alives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let params = Parameters::stream().keep_alive(Duration::from_millis(30));
        let (conn, mut events) = Connection::connect(addr.into(), params);
        let (mut peer, _) = listener.accept().await.unwrap();
        conn.ready().await.unwrap();

        let mut decoder = FrameDecoder::new(1024);
        let mut buf = [0u8; 64];
        let frame = timeout(Duration::from_secs(2), async {
            loop {
                if let Some(frame) = decoder.next_frame().unwrap() {
                    return frame;
                }
                let n = peer.read(&mut buf).await.unwrap();
                decoder.push(&buf[..n]);
            }
        })
        .await
        .expect("keep-alive while idle");
        assert_eq!(frame.frame_type, FrameType::KeepAlive);
        assert!(frame.body.is_empty());

        // Incoming keep-alives are absorbed; only the data frame surfaces.
        let mut wire = Frame::keep_alive().encode_stream();
        wire.extend(Frame::data(b"after".to_vec(), false).encode_stream());
        peer.write_all(&wire).await.unwrap();

        let message = loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Message(message) => break message,
                ConnectionEvent::State(state) => assert!(!state.is_terminal()),
            }
        };
        assert_eq!(message.payload, b"after");
        assert_eq!(conn.stats().messages_received, 1);
        assert_eq!(conn.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_send_before_ready_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (conn, _events) = Connection::connect(
            listener.local_addr().unwrap().into(),
            Parameters::stream(),
        );

        // The driver has not run yet on this single-threaded runtime.
        assert!(matches!(
            conn.enqueue(b"early".to_vec(), false),
            Err(TransportError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_close_fails_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (conn, mut events) = Connection::connect(addr.into(), Parameters::stream());
        let (mut peer, _) = listener.accept().await.unwrap();
        conn.ready().await.unwrap();

        peer.write_all(&Frame::data(b"bye".to_vec(), true).encode_stream())
            .await
            .unwrap();

        let mut got_message = false;
        loop {
            match events.recv().await.unwrap() {
                ConnectionEvent::Message(msg) => {
                    assert_eq!(msg.payload, b"bye");
                    assert!(msg.is_final);
                    got_message = true;
                }
                ConnectionEvent::State(ConnectionState::Failed(failure)) => {
                    assert_eq!(failure.kind, ErrorKind::ConnectionLost);
                    break;
                }
                ConnectionEvent::State(_) => {}
            }
        }
        assert!(got_message);
        assert!(matches!(
            conn.send(b"late".to_vec(), false).await,
            Err(TransportError::NotReady { state: "failed" })
        ));
    }

    #[tokio::test]
    async fn test_connect_timeout_fails_exactly_once() {
        // Accepts the TCP connection but never answers the handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let params = Parameters::stream()
            .connect_timeout(Duration::from_millis(150))
            .security(SecurityConfig::default());

        let (conn, mut events) = Connection::connect(listener.local_addr().unwrap().into(), params);

        let mut failures = 0;
        assert_eq!(next_state(&mut events).await, ConnectionState::Preparing);
        match next_state(&mut events).await {
            ConnectionState::Failed(failure) => {
                assert_eq!(failure.kind, ErrorKind::Timeout);
                failures += 1;
            }
            other => panic!("unexpected state {other}"),
        }

        conn.cancel();
        assert_eq!(next_state(&mut events).await, ConnectionState::Cancelled);
        assert!(events.recv().await.is_none());
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_refused_connect_waits_then_fails() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let params = Parameters::stream().waiting_retry(Duration::from_millis(10), 1);
        let (_conn, mut events) = Connection::connect(addr.into(), params);

        assert_eq!(next_state(&mut events).await, ConnectionState::Preparing);
        assert!(matches!(next_state(&mut events).await, ConnectionState::Waiting(_)));
        assert_eq!(next_state(&mut events).await, ConnectionState::Preparing);
        match next_state(&mut events).await {
            ConnectionState::Failed(failure) => assert_eq!(failure.kind, ErrorKind::ConnectionLost),
            other => panic!("unexpected state {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_completes_pending_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (conn, _events) = Connection::connect(addr.into(), Parameters::stream());
        let (_peer, _) = listener.accept().await.unwrap();
        conn.ready().await.unwrap();

        let pending: Vec<_> = (0..8)
            .map(|i| conn.enqueue(vec![i; 16], false).unwrap())
            .collect();
        conn.cancel();

        for send in pending {
            match send.wait().await {
                Ok(()) | Err(TransportError::Cancelled) => {}
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert_eq!(conn.state(), ConnectionState::Cancelled);
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (conn, mut events) =
            Connection::connect(peer.local_addr().unwrap().into(), Parameters::datagram());
        conn.ready().await.unwrap();

        conn.send(b"pos".to_vec(), false).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(Frame::decode_datagram(&buf[..n]).unwrap().body, b"pos");

        peer.send_to(&Frame::data(b"ack".to_vec(), false).encode_datagram(), from)
            .await
            .unwrap();
        loop {
            if let ConnectionEvent::Message(msg) = events.recv().await.unwrap() {
                assert_eq!(msg.payload, b"ack");
                break;
            }
        }
        assert_eq!(conn.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (conn, _events) =
            Connection::connect(peer.local_addr().unwrap().into(), Parameters::datagram());
        conn.ready().await.unwrap();

        assert!(matches!(
            conn.enqueue(vec![0; MAX_DATAGRAM_SIZE], false),
            Err(TransportError::PayloadTooLarge { .. })
        ));
        assert!(conn.state().is_ready());
    }
}
