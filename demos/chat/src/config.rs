//! Demo configuration from the environment.

use std::env;
use std::net::SocketAddr;

use peerlink::client::ClientError;
use peerlink::server::ServerError;
use peerlink::transport::{Endpoint, TransportKind};
use thiserror::Error;

const DEFAULT_BIND: &str = "0.0.0.0:19999";
const DEFAULT_SERVER: &str = "127.0.0.1:19999";

/// Errors surfaced by the demo.
#[derive(Debug, Error)]
pub enum DemoError {
    #[error("invalid {var}: {reason}")]
    Config { var: &'static str, reason: String },

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("stdin: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub mode: Mode,
    pub bind: SocketAddr,
    pub server: Endpoint,
    pub transport: TransportKind,
    pub name: String,
    pub log_filter: String,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl DemoConfig {
    pub fn from_env() -> Result<Self, DemoError> {
        let mode = match var("PEERLINK_MODE").as_deref().map(str::to_ascii_lowercase) {
            None => Mode::Client,
            Some(m) if m == "client" => Mode::Client,
            Some(m) if m == "server" => Mode::Server,
            Some(other) => {
                return Err(DemoError::Config {
                    var: "PEERLINK_MODE",
                    reason: format!("expected server or client, got {other:?}"),
                });
            }
        };

        let bind = var("PEERLINK_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| DemoError::Config {
                var: "PEERLINK_BIND",
                reason: e.to_string(),
            })?;

        let server = var("PEERLINK_SERVER")
            .unwrap_or_else(|| DEFAULT_SERVER.to_string())
            .parse::<Endpoint>()
            .map_err(|e| DemoError::Config {
                var: "PEERLINK_SERVER",
                reason: e.to_string(),
            })?;

        let transport = match var("PEERLINK_TRANSPORT") {
            Some(kind) => kind.parse::<TransportKind>().map_err(|e| DemoError::Config {
                var: "PEERLINK_TRANSPORT",
                reason: e.to_string(),
            })?,
            None => TransportKind::Stream,
        };

        let name = var("PEERLINK_NAME")
            .or_else(|| var("USER"))
            .unwrap_or_else(|| "anonymous".to_string());

        Ok(Self {
            mode,
            bind,
            server,
            transport,
            name,
            log_filter: var("PEERLINK_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}
