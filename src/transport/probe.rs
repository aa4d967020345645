//! Reachability probe.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::connection::{Connection, Parameters};
use super::endpoint::Endpoint;
use crate::core::Failure;

/// Open a connection to `endpoint`, measure the time it takes to reach
/// `ready` (handshake included when `params` is secure), then cancel it.
///
/// The connect timeout in `params` bounds the probe.
pub async fn probe(endpoint: Endpoint, params: Parameters) -> Result<Duration, Failure> {
    let started = Instant::now();
    let label = endpoint.to_string();
    let (connection, _events) = Connection::connect(endpoint, params);

    let result = connection.ready().await.map(|()| started.elapsed());
    connection.cancel();

    match &result {
        Ok(latency) => debug!(endpoint = %label, ?latency, "probe succeeded"),
        Err(failure) => debug!(endpoint = %label, error = %failure, "probe failed"),
    }
    result
}
