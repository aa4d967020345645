//! Relay server: every chat line is forwarded to everyone else.

use peerlink::server::{Server, ServerBuilder, ServerEvent};
use tracing::{info, warn};

use crate::config::{DemoConfig, DemoError};

pub async fn run(config: &DemoConfig) -> Result<(), DemoError> {
    let server_config = ServerBuilder::new()
        .bind_addr(config.bind)
        .transport(config.transport)
        .build();
    let (server, mut events) = Server::start(server_config).await?;
    info!(addr = %server.local_addr(), transport = %config.transport, "chat relay listening");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ServerEvent::Connected { id, remote }) => {
                    info!(%id, %remote, online = server.connection_count(), "peer joined");
                }
                Some(ServerEvent::MessageReceived { from, payload }) => {
                    info!(%from, line = %String::from_utf8_lossy(&payload), "relayed");
                }
                Some(ServerEvent::Disconnected { id, failure: Some(failure) }) => {
                    warn!(%id, %failure, "peer lost");
                }
                Some(ServerEvent::Disconnected { id, failure: None }) => {
                    info!(%id, "peer left");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    server.shutdown().await;
    info!(relayed = server.relayed_messages(), "relay stopped");
    Ok(())
}
