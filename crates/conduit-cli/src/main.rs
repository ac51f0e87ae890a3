#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod config;
mod server;

use std::collections::HashMap;
use std::process;

use anyhow::Context;
use axum::Router;
use conduit_server::handler::routes;
use conduit_server::middleware::{RecoveryConfig, RouterExt};
use conduit_server::service::ServiceState;
use tokio_util::sync::CancellationToken;

use crate::config::{Cli, Node, create_node};
use crate::server::ServerError;

// Tracing target constants
pub const TRACING_TARGET_SERVER_STARTUP: &str = "conduit_cli::server::startup";
pub const TRACING_TARGET_SERVER_SHUTDOWN: &str = "conduit_cli::server::shutdown";
pub const TRACING_TARGET_CONFIG: &str = "conduit_cli::config";

#[tokio::main]
async fn main() {
    let Err(error) = run().await else {
        tracing::info!(
            target: TRACING_TARGET_SERVER_SHUTDOWN,
            "application terminated successfully"
        );
        process::exit(0);
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SERVER_SHUTDOWN,
            error = %error,
            "application terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }

    if let Some(server_error) = error.downcast_ref::<ServerError>() {
        tracing::error!(
            target: TRACING_TARGET_SERVER_SHUTDOWN,
            code = server_error.error_code(),
            suggestion = ?server_error.suggestion(),
            recoverable = server_error.is_recoverable(),
            "server error details"
        );
    }

    process::exit(1);
}

/// Main application entry point.
async fn run() -> anyhow::Result<()> {
    let cli = Cli::init();
    Cli::init_tracing();
    cli.log();
    cli.validate()
        .map_err(|err| ServerError::InvalidConfig(format!("{err:#}")))?;

    let Node { state, allocator } = create_node(&cli).context("failed to create node")?;
    let router = create_router(state.clone(), &cli.recovery);

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(server::shutdown_signal(shutdown.clone()));

    let metadata = HashMap::from([
        ("baseUri".to_string(), cli.slots.base_uri.clone()),
        ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ]);
    let heartbeat = server::spawn_heartbeat(
        allocator,
        cli.collaborators.vm_id.clone(),
        metadata,
        cli.collaborators.heartbeat_interval(),
        shutdown.clone(),
    );

    let served = server::serve(router, &cli.server, shutdown.clone()).await;

    shutdown.cancel();
    signals.abort();
    if let Err(err) = heartbeat.await {
        tracing::warn!(
            target: TRACING_TARGET_SERVER_SHUTDOWN,
            error = %err,
            "heartbeat task ended abnormally"
        );
    }

    let drained = server::drain(&state, cli.server.shutdown_timeout()).await;
    served?;
    drained?;
    Ok(())
}

/// Creates the router with all middleware layers applied.
///
/// Middleware is applied in reverse order (last added = outermost):
/// 1. Recovery (outermost) - catches panics and enforces timeouts
/// 2. Observability - request IDs, tracing spans and request logs
/// 3. Routes (innermost) - actual request handlers
fn create_router(state: ServiceState, recovery: &RecoveryConfig) -> Router {
    routes()
        .with_state(state)
        .with_observability_layer()
        .with_error_handling_layer(recovery)
}
