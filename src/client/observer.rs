//! Callback-style consumption of client events.

use std::time::Duration;

use super::client::{ClientEvent, ClientEvents, DisconnectReason};
use crate::core::Failure;

/// Receives client events. Every method defaults to doing nothing.
///
/// [`ClientEvents::dispatch`] calls these from a single task, in event
/// order, so implementations need no synchronization of their own.
pub trait ClientObserver: Send {
    /// The connection reached `ready`.
    fn on_connected(&mut self) {}

    /// The connection went away.
    fn on_disconnected(&mut self, _reason: &DisconnectReason) {}

    /// A payload arrived.
    fn on_message_received(&mut self, _payload: &[u8]) {}

    /// An operation or connection failed.
    fn on_error(&mut self, _failure: &Failure) {}

    /// A reconnect attempt was scheduled.
    fn on_reconnect_scheduled(&mut self, _attempt: u32, _delay: Duration) {}

    /// The reconnect policy gave up.
    fn on_reconnect_exhausted(&mut self, _attempts: u32) {}
}

impl ClientEvents {
    /// Deliver every event to `observer` until the client is dropped.
    pub async fn dispatch<O: ClientObserver + ?Sized>(mut self, observer: &mut O) {
        while let Some(event) = self.recv().await {
            match &event {
                ClientEvent::Connected => observer.on_connected(),
                ClientEvent::Disconnected(reason) => observer.on_disconnected(reason),
                ClientEvent::MessageReceived(payload) => observer.on_message_received(payload),
                ClientEvent::Error(failure) => observer.on_error(failure),
                ClientEvent::ReconnectScheduled { attempt, delay } => {
                    observer.on_reconnect_scheduled(*attempt, *delay)
                }
                ClientEvent::ReconnectExhausted { attempts } => {
                    observer.on_reconnect_exhausted(*attempts)
                }
            }
        }
    }
}
