//! High-level chat/state client.
//!
//! Owns exactly one outbound connection and reconnects with exponential
//! backoff when that connection fails unexpectedly. A user-initiated
//! disconnect never triggers reconnection.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, trace, warn};

use super::backoff::{Backoff, ReconnectPolicy};
use crate::core::{Classify, DEFAULT_CLOSE_TIMEOUT, ErrorKind, Failure};
use crate::security::SecurityConfig;
use crate::transport::{
    Connection, ConnectionEvent, ConnectionEvents, ConnectionState, Endpoint, Parameters,
    TransportError, TransportKind,
};

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client is not connected.
    #[error("client not connected (state: {state})")]
    NotConnected {
        /// Client state when the call was made.
        state: &'static str,
    },

    /// The transport rejected or failed the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The client task is gone.
    #[error("client stopped")]
    Stopped,
}

impl Classify for ClientError {
    fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NotConnected { .. } => ErrorKind::NotReady,
            ClientError::Transport(e) => e.kind(),
            ClientError::Stopped => ErrorKind::Cancelled,
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Parameters for every connection attempt.
    pub parameters: Parameters,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Payload of the final message sent by a graceful disconnect.
    pub farewell: Vec<u8>,

    /// How long a graceful disconnect waits for the final message.
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            parameters: Parameters::default(),
            reconnect: ReconnectPolicy::default(),
            farewell: Vec::new(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Builder for creating a [`ClientConfig`].
#[derive(Debug)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Choose stream or datagram transport.
    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.parameters.kind = kind;
        self
    }

    /// Replace the connection parameters.
    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.config.parameters = parameters;
        self
    }

    /// Secure the connection.
    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.parameters.security = Some(security);
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.parameters.connect_timeout = timeout;
        self
    }

    /// Send keep-alives on an idle stream connection.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.config.parameters.keep_alive = Some(interval);
        self
    }

    /// Set the reconnection policy.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    /// Set the graceful-disconnect payload.
    pub fn farewell(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.config.farewell = payload.into();
        self
    }

    /// Build the client configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Client state, superimposed on the connection's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection and none scheduled.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// The connection is ready.
    Connected,
    /// Waiting `delay` before attempt `attempt`.
    Reconnecting {
        /// Attempt index since the last successful connection.
        attempt: u32,
        /// Scheduled delay.
        delay: Duration,
    },
}

impl ClientState {
    /// Short state name.
    pub fn name(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Reconnecting { .. } => "reconnecting",
        }
    }
}

/// Why the client left `connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called.
    UserInitiated,
    /// The connection failed.
    Lost(Failure),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::UserInitiated => f.write_str("disconnected by user"),
            DisconnectReason::Lost(failure) => write!(f, "connection lost ({failure})"),
        }
    }
}

/// Event from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connected to the server.
    Connected,
    /// Left `connected`, or a connection attempt ended for good.
    Disconnected(DisconnectReason),
    /// A payload arrived.
    MessageReceived(Vec<u8>),
    /// A connection or attempt failed.
    Error(Failure),
    /// The next attempt is scheduled.
    ReconnectScheduled {
        /// Attempt index since the last successful connection.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The policy ran out of attempts; the client stays disconnected.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Receiving side of the client's event stream.
#[derive(Debug)]
pub struct ClientEvents {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientEvents {
    /// Next event; `None` once the client is dropped.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug)]
enum Command {
    Connect(Endpoint),
    Disconnect {
        graceful: bool,
        done: oneshot::Sender<()>,
    },
}

/// A chat/state client.
///
/// # Example
///
/// ```ignore
/// use peerlink::client::{Client, ClientBuilder, ClientEvent};
///
/// let (client, mut events) = Client::new(ClientBuilder::new().build());
/// client.connect("127.0.0.1", 7000)?;
///
/// while let Some(event) = events.recv().await {
///     match event {
///         ClientEvent::Connected => client.send(b"hello".to_vec()).await?,
///         ClientEvent::MessageReceived(payload) => println!("{payload:?}"),
///         _ => {}
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ClientState>,
    current: watch::Receiver<Option<Connection>>,
}

impl Client {
    /// Create a client and spawn its task. Must be called inside a Tokio
    /// runtime. Dropping the client cancels its connection.
    pub fn new(config: ClientConfig) -> (Self, ClientEvents) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (current_tx, current_rx) = watch::channel(None);

        let actor = Actor {
            backoff: Backoff::new(config.reconnect),
            config,
            commands: commands_rx,
            events: events_tx,
            state: state_tx,
            current: current_tx,
            endpoint: None,
            link: None,
            retry_at: None,
        };
        tokio::spawn(actor.run());

        (
            Self {
                commands: commands_tx,
                state: state_rx,
                current: current_rx,
            },
            ClientEvents { rx: events_rx },
        )
    }

    /// Connect to `host:port`. A no-op while connecting or connected.
    pub fn connect(&self, host: impl Into<String>, port: u16) -> Result<(), ClientError> {
        self.connect_to(Endpoint::host_port(host, port))
    }

    /// Connect to any endpoint, service names included.
    pub fn connect_to(&self, endpoint: Endpoint) -> Result<(), ClientError> {
        self.commands
            .send(Command::Connect(endpoint))
            .map_err(|_| ClientError::Stopped)
    }

    /// Send a payload. Only valid while connected; nothing is buffered
    /// while reconnecting.
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), ClientError> {
        let state = *self.state.borrow();
        let connection = match state {
            ClientState::Connected => self.current.borrow().clone(),
            _ => None,
        };
        let connection = connection.ok_or(ClientError::NotConnected { state: state.name() })?;
        connection.send(payload, false).await?;
        Ok(())
    }

    /// User-initiated disconnect. When `graceful`, a final message is sent
    /// before cancelling. Never triggers reconnection; idempotent.
    pub async fn disconnect(&self, graceful: bool) -> Result<(), ClientError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { graceful, done })
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }

    /// Current client state.
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// A receiver observing state changes.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    /// The live connection, while connected.
    pub fn connection(&self) -> Option<Connection> {
        self.current.borrow().clone()
    }
}

enum Step {
    Command(Option<Command>),
    Connection(Option<ConnectionEvent>),
    Retry,
}

/// The client task: sole owner of the connection, the backoff counter and
/// the published state.
struct Actor {
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<ClientState>,
    current: watch::Sender<Option<Connection>>,
    backoff: Backoff,
    endpoint: Option<Endpoint>,
    link: Option<(Connection, ConnectionEvents)>,
    retry_at: Option<Instant>,
}

async fn next_event(link: &mut Option<(Connection, ConnectionEvents)>) -> Option<ConnectionEvent> {
    match link {
        Some((_, events)) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                event = next_event(&mut self.link) => Step::Connection(event),
                _ = retry_due(self.retry_at) => Step::Retry,
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(Command::Connect(endpoint))) => self.on_connect(endpoint),
                Step::Command(Some(Command::Disconnect { graceful, done })) => {
                    self.on_disconnect(graceful).await;
                    let _ = done.send(());
                }
                Step::Connection(Some(event)) => self.on_connection_event(event),
                Step::Connection(None) => {
                    // Driver finished without a terminal state we saw.
                    let cancelled = self
                        .link
                        .take()
                        .is_some_and(|(connection, _)| connection.state() == ConnectionState::Cancelled);
                    if cancelled {
                        self.on_cancelled();
                    } else {
                        self.on_failure(Failure::from_error(&TransportError::ConnectionLost(
                            "connection ended".into(),
                        )));
                    }
                }
                Step::Retry => {
                    self.retry_at = None;
                    self.start_attempt();
                }
            }
        }

        if let Some((connection, _)) = self.link.take() {
            connection.cancel();
        }
        debug!("client task stopped");
    }

    fn publish(&self, state: ClientState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = previous.name(), to = state.name(), "client state");
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn current_state(&self) -> ClientState {
        *self.state.borrow()
    }

    fn on_connect(&mut self, endpoint: Endpoint) {
        match self.current_state() {
            ClientState::Connecting | ClientState::Connected => {
                trace!("connect ignored, already connecting or connected");
            }
            ClientState::Reconnecting { .. } => {
                self.endpoint = Some(endpoint);
                self.retry_at = None;
                self.start_attempt();
            }
            ClientState::Disconnected => {
                self.endpoint = Some(endpoint);
                self.backoff.reset();
                self.start_attempt();
            }
        }
    }

    fn start_attempt(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        info!(%endpoint, "connecting");
        let link = Connection::connect(endpoint, self.config.parameters.clone());
        self.link = Some(link);
        self.publish(ClientState::Connecting);
    }

    async fn on_disconnect(&mut self, graceful: bool) {
        self.retry_at = None;
        self.current.send_replace(None);

        if let Some((connection, _events)) = self.link.take() {
            if graceful && connection.state().is_ready() {
                match connection.enqueue(self.config.farewell.clone(), true) {
                    Ok(pending) => match timeout(self.config.close_timeout, pending.wait()).await {
                        Ok(Ok(())) => trace!("final message sent"),
                        Ok(Err(e)) => debug!(error = %e, "final message failed"),
                        Err(_) => debug!("final message timed out"),
                    },
                    Err(e) => debug!(error = %e, "final message rejected"),
                }
            }
            connection.cancel();
        }

        if self.current_state() != ClientState::Disconnected {
            info!("disconnected by user");
            self.publish(ClientState::Disconnected);
            self.emit(ClientEvent::Disconnected(DisconnectReason::UserInitiated));
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::State(ConnectionState::Ready) => {
                self.backoff.reset();
                let connection = self.link.as_ref().map(|(c, _)| c.clone());
                self.current.send_replace(connection);
                info!("connected");
                self.publish(ClientState::Connected);
                self.emit(ClientEvent::Connected);
            }
            ConnectionEvent::State(ConnectionState::Failed(failure)) => {
                if let Some((connection, _)) = self.link.take() {
                    connection.cancel();
                }
                self.on_failure(failure);
            }
            ConnectionEvent::State(ConnectionState::Cancelled) => {
                self.link = None;
                self.on_cancelled();
            }
            ConnectionEvent::State(state) => trace!(%state, "connection state"),
            ConnectionEvent::Message(message) => {
                if !(message.is_final && message.payload.is_empty()) {
                    self.emit(ClientEvent::MessageReceived(message.payload));
                }
            }
        }
    }

    fn on_failure(&mut self, failure: Failure) {
        let was_connected = self.current_state() == ClientState::Connected;
        self.current.send_replace(None);
        warn!(error = %failure, was_connected, "connection failed");

        self.emit(ClientEvent::Error(failure.clone()));
        if was_connected {
            self.emit(ClientEvent::Disconnected(DisconnectReason::Lost(failure.clone())));
        }

        if failure.kind.is_retryable() {
            self.schedule_retry();
        } else {
            self.publish(ClientState::Disconnected);
            if !was_connected {
                self.emit(ClientEvent::Disconnected(DisconnectReason::Lost(failure)));
            }
        }
    }

    /// The connection was cancelled from outside the client. Never retried.
    fn on_cancelled(&mut self) {
        self.retry_at = None;
        self.current.send_replace(None);
        if self.current_state() == ClientState::Disconnected {
            return;
        }
        info!("connection cancelled");
        self.publish(ClientState::Disconnected);
        let failure = Failure::from_error(&TransportError::Cancelled);
        self.emit(ClientEvent::Disconnected(DisconnectReason::Lost(failure)));
    }

    fn schedule_retry(&mut self) {
        match self.backoff.next_delay() {
            Some((attempt, delay)) => {
                info!(attempt, ?delay, "reconnect scheduled");
                self.retry_at = Some(Instant::now() + delay);
                self.publish(ClientState::Reconnecting { attempt, delay });
                self.emit(ClientEvent::ReconnectScheduled { attempt, delay });
            }
            None => {
                let attempts = self.backoff.attempts();
                warn!(attempts, "reconnect attempts exhausted");
                self.publish(ClientState::Disconnected);
                self.emit(ClientEvent::ReconnectExhausted { attempts });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_config(max_attempts: u32) -> ClientConfig {
        ClientBuilder::new()
            .parameters(Parameters::stream().waiting_retry(Duration::from_millis(1), 0))
            .reconnect(ReconnectPolicy {
                base: Duration::from_millis(10),
                ceiling: Duration::from_millis(25),
                max_attempts,
            })
            .build()
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_rejected() {
        let (client, _events) = Client::new(fast_config(0));
        let err = client.send(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, ClientError::NotConnected { state: "disconnected" }));
        assert_eq!(err.kind(), ErrorKind::NotReady);
    }

    #[tokio::test]
    async fn test_backoff_schedule_then_exhausted() {
        let port = closed_port().await;
        let (client, mut events) = Client::new(fast_config(3));
        client.connect("127.0.0.1", port).unwrap();

        let mut scheduled = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ClientEvent::ReconnectScheduled { attempt, delay } => scheduled.push((attempt, delay)),
                ClientEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                ClientEvent::Error(failure) => assert_eq!(failure.kind, ErrorKind::ConnectionLost),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(
            scheduled,
            vec![
                (0, Duration::from_millis(10)),
                (1, Duration::from_millis(20)),
                (2, Duration::from_millis(25)),
            ]
        );
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, mut events) = Client::new(fast_config(0));

        client.connect("127.0.0.1", port).unwrap();
        client.connect("127.0.0.1", port).unwrap();
        assert_eq!(events.recv().await, Some(ClientEvent::Connected));
        client.connect("127.0.0.1", port).unwrap();

        let (_first, _) = listener.accept().await.unwrap();
        // A second connection attempt would show up here.
        let second = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(second.is_err());
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_graceful_disconnect_twice_never_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, mut events) = Client::new(fast_config(5));

        client.connect("127.0.0.1", port).unwrap();
        assert_eq!(events.recv().await, Some(ClientEvent::Connected));

        client.disconnect(true).await.unwrap();
        client.disconnect(true).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::Disconnected(DisconnectReason::UserInitiated))
        );

        let quiet = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(quiet.is_err(), "no further events expected");
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_cancelled_connection_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, mut events) = Client::new(fast_config(5));

        client.connect("127.0.0.1", port).unwrap();
        assert_eq!(events.recv().await, Some(ClientEvent::Connected));
        let (_accepted, _) = listener.accept().await.unwrap();

        client.connection().expect("live connection").cancel();

        match events.recv().await {
            Some(ClientEvent::Disconnected(DisconnectReason::Lost(failure))) => {
                assert_eq!(failure.kind, ErrorKind::Cancelled);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let quiet = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(quiet.is_err(), "cancellation must not schedule a reconnect");

        let again = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(again.is_err());
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.connection().is_none());
    }

    #[tokio::test]
    async fn test_attempts_reset_after_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, mut events) = Client::new(fast_config(5));

        client.connect("127.0.0.1", port).unwrap();
        assert_eq!(events.recv().await, Some(ClientEvent::Connected));

        // Server drops the connection twice; each loss restarts at attempt 0.
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
            loop {
                match events.recv().await.unwrap() {
                    ClientEvent::ReconnectScheduled { attempt, .. } => {
                        assert_eq!(attempt, 0);
                        break;
                    }
                    ClientEvent::Error(_) | ClientEvent::Disconnected(DisconnectReason::Lost(_)) => {}
                    other => panic!("unexpected event {other:?}"),
                }
            }
            assert_eq!(events.recv().await, Some(ClientEvent::Connected));
        }
    }
}
