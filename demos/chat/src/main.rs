//! peerlink chat demo
//!
//! A relay server and an interactive line-based client.
//!
//! Environment variables:
//! - PEERLINK_MODE: "server" or "client" (default: client)
//! - PEERLINK_BIND: Bind address (server only, default 0.0.0.0:19999)
//! - PEERLINK_SERVER: Server address as host:port (client only, default 127.0.0.1:19999)
//! - PEERLINK_TRANSPORT: "stream" or "datagram" (default: stream)
//! - PEERLINK_NAME: Display name prefixed to chat lines (client only)
//! - PEERLINK_LOG: tracing filter, e.g. debug or peerlink=trace (default: info)

mod client;
mod config;
mod server;

use std::process::ExitCode;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{DemoConfig, DemoError, Mode};

fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

async fn run(config: DemoConfig) -> Result<(), DemoError> {
    match config.mode {
        Mode::Server => server::run(&config).await,
        Mode::Client => client::run(&config).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match DemoConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("peerlink-chat: {e}");
            return ExitCode::from(2);
        }
    };
    init_logging(&config.log_filter);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "chat demo failed");
            ExitCode::FAILURE
        }
    }
}
