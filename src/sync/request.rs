//! Request/response exchanges over a datagram connection.
//!
//! Wire format:
//! ```text
//! +0  Kind (1 byte: 0 = request, 1 = response)
//! +1  Request ID (4 bytes BE)
//! +5  Payload (variable)
//! ```
//!
//! Every request carries its own timeout. A response arriving after the
//! timeout finds no waiter and is discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::{Classify, ErrorKind};
use crate::transport::{Connection, ConnectionEvent, ConnectionEvents, TransportError};

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;

/// Request header size (kind + id).
pub const REQUEST_HEADER_SIZE: usize = 5;

/// Errors from a request exchange.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No response within the caller's timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The request could not be sent.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connection ended while waiting.
    #[error("connection closed before a response arrived")]
    Closed,
}

impl Classify for RequestError {
    fn kind(&self) -> ErrorKind {
        match self {
            RequestError::Timeout(_) => ErrorKind::Timeout,
            RequestError::Transport(e) => e.kind(),
            RequestError::Closed => ErrorKind::ConnectionLost,
        }
    }
}

/// A request received from the peer, to be answered with
/// [`Requester::respond`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    /// Request ID echoed in the response.
    pub id: u32,
    /// Request payload.
    pub payload: Vec<u8>,
}

/// Stream of requests from the peer.
#[derive(Debug)]
pub struct IncomingRequests {
    rx: mpsc::UnboundedReceiver<IncomingRequest>,
}

impl IncomingRequests {
    /// Next request; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<IncomingRequest> {
        self.rx.recv().await
    }
}

type Waiters = Arc<Mutex<HashMap<u32, oneshot::Sender<Vec<u8>>>>>;

fn lock(waiters: &Waiters) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<Vec<u8>>>> {
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pairs requests with responses on one connection.
#[derive(Debug)]
pub struct Requester {
    connection: Connection,
    waiters: Waiters,
    pump: JoinHandle<()>,
}

impl Requester {
    /// Take over a connection's event stream. Payloads that are neither
    /// requests nor responses are dropped.
    pub fn new(connection: Connection, events: ConnectionEvents) -> (Self, IncomingRequests) {
        let waiters: Waiters = Arc::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(events, Arc::clone(&waiters), tx));
        (
            Self {
                connection,
                waiters,
                pump,
            },
            IncomingRequests { rx },
        )
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Requests still waiting for a response.
    pub fn pending(&self) -> usize {
        lock(&self.waiters).len()
    }

    /// Send `payload` and wait up to `timeout` for the matching response.
    ///
    /// Dropping the returned future withdraws the request.
    pub async fn request(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, RequestError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut waiters = lock(&self.waiters);
            let mut id = OsRng.next_u32();
            while waiters.contains_key(&id) {
                id = OsRng.next_u32();
            }
            waiters.insert(id, tx);
            id
        };
        let _withdraw = Withdraw {
            waiters: &self.waiters,
            id,
        };

        self.connection
            .send(encode(KIND_REQUEST, id, payload), false)
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => {
                debug!(id, ?timeout, "request timed out");
                Err(RequestError::Timeout(timeout))
            }
        }
    }

    /// Answer a request from the peer.
    pub async fn respond(&self, request: &IncomingRequest, payload: &[u8]) -> Result<(), TransportError> {
        self.connection
            .send(encode(KIND_RESPONSE, request.id, payload), false)
            .await
    }
}

impl Drop for Requester {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Removes a waiter however its request ends.
struct Withdraw<'a> {
    waiters: &'a Waiters,
    id: u32,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        lock(self.waiters).remove(&self.id);
    }
}

fn encode(kind: u8, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REQUEST_HEADER_SIZE + payload.len());
    buf.push(kind);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn decode(data: &[u8]) -> Option<(u8, u32, &[u8])> {
    if data.len() < REQUEST_HEADER_SIZE {
        return None;
    }
    let id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Some((data[0], id, &data[REQUEST_HEADER_SIZE..]))
}

async fn pump(
    mut events: ConnectionEvents,
    waiters: Waiters,
    requests: mpsc::UnboundedSender<IncomingRequest>,
) {
    while let Some(event) = events.recv().await {
        let ConnectionEvent::Message(message) = event else {
            continue;
        };
        match decode(&message.payload) {
            Some((KIND_REQUEST, id, payload)) => {
                let _ = requests.send(IncomingRequest {
                    id,
                    payload: payload.to_vec(),
                });
            }
            Some((KIND_RESPONSE, id, payload)) => {
                let waiter = lock(&waiters).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(payload.to_vec());
                    }
                    None => trace!(id, "discarding late or unknown response"),
                }
            }
            _ => trace!(len = message.payload.len(), "dropping non-request datagram"),
        }
    }
    // Wake every waiter with `Closed`.
    lock(&waiters).clear();
}
