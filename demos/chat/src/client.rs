//! Interactive client: stdin lines out, relayed lines to stdout.

use std::time::Duration;

use peerlink::client::{Client, ClientBuilder, ClientObserver, DisconnectReason};
use peerlink::core::Failure;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::{DemoConfig, DemoError};

struct Printer;

impl ClientObserver for Printer {
    fn on_connected(&mut self) {
        info!("connected");
    }

    fn on_disconnected(&mut self, reason: &DisconnectReason) {
        info!(%reason, "disconnected");
    }

    fn on_message_received(&mut self, payload: &[u8]) {
        println!("{}", String::from_utf8_lossy(payload));
    }

    fn on_error(&mut self, failure: &Failure) {
        warn!(%failure, "connection error");
    }

    fn on_reconnect_scheduled(&mut self, attempt: u32, delay: Duration) {
        info!(attempt, ?delay, "reconnecting");
    }

    fn on_reconnect_exhausted(&mut self, attempts: u32) {
        warn!(attempts, "giving up on the server");
    }
}

pub async fn run(config: &DemoConfig) -> Result<(), DemoError> {
    let client_config = ClientBuilder::new()
        .transport(config.transport)
        .farewell(format!("* {} left", config.name))
        .build();
    let (client, events) = Client::new(client_config);

    let printer = tokio::spawn(async move { events.dispatch(&mut Printer).await });

    client.connect_to(config.server.clone())?;
    info!(server = %config.server, name = %config.name, "type a line and press enter; ctrl-d quits");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = client.send(format!("{}: {line}", config.name).into_bytes()).await {
            warn!(error = %e, "line not sent");
        }
    }

    client.disconnect(true).await?;
    drop(client);
    let _ = printer.await;
    Ok(())
}
