pub mod config;
pub mod data;
pub mod decoder;
pub mod drain;
pub mod errors;
pub mod lifecycle;
pub mod metrics_defs;
pub mod proto;
pub mod service;
pub mod sink;
pub mod stats;

#[cfg(test)]
mod testutils;

use crate::errors::IngestError;
use std::future::Future;

/// Header carrying the tenant token, on ingress (by default) and egress.
pub const TOKEN_HEADER: &str = "X-SF-Token";

/// Bring up a server from config and run it until `shutdown` resolves,
/// then drain gracefully and close.
pub async fn run(
    config: config::Config,
    shutdown: impl Future<Output = ()>,
) -> Result<(), IngestError> {
    let server = lifecycle::Server::setup(config).await?;
    server.run_until(shutdown).await
}
