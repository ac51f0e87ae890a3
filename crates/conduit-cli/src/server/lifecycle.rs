//! Server lifecycle management.

use std::future::Future;
use std::io;
use std::time::{Duration, Instant};

use conduit_server::service::ServiceState;

use super::{ServerError, TRACING_TARGET_SHUTDOWN, TRACING_TARGET_STARTUP};
use crate::config::ServerConfig;

/// Serves with lifecycle logging.
pub async fn serve_with_shutdown<F>(
    server_config: &ServerConfig,
    serve_fn: impl FnOnce() -> F,
) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let start_time = Instant::now();

    if server_config.binds_to_all_interfaces() {
        tracing::warn!(
            target: TRACING_TARGET_STARTUP,
            "Server bound to all interfaces (0.0.0.0) - ensure firewall is configured"
        );
    }

    let result = serve_fn().await;
    handle_result(result, start_time)
}

/// Closes relay sessions and the slot registry within `timeout`.
///
/// # Errors
///
/// Returns [`ServerError::Drain`] if slots were still busy when the registry
/// gave up, or when `timeout` elapsed first.
pub async fn drain(state: &ServiceState, timeout: Duration) -> Result<(), ServerError> {
    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        sessions = state.sessions.len(),
        slots = state.slots.registry().len(),
        timeout_secs = timeout.as_secs(),
        "Draining slots and relay sessions"
    );

    match tokio::time::timeout(timeout, state.shutdown()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ServerError::Drain(err)),
        Err(_) => Err(ServerError::Drain(conduit_core::Error::timeout(format!(
            "slots still busy after {}s",
            timeout.as_secs()
        )))),
    }
}

fn handle_result(result: io::Result<()>, start_time: Instant) -> io::Result<()> {
    let uptime = start_time.elapsed();

    match result {
        Ok(()) => {
            tracing::info!(
                target: TRACING_TARGET_SHUTDOWN,
                uptime_secs = uptime.as_secs(),
                "Server stopped accepting requests"
            );
            Ok(())
        }
        Err(err) => {
            tracing::error!(
                target: TRACING_TARGET_SHUTDOWN,
                error = %err,
                kind = ?err.kind(),
                uptime_secs = uptime.as_secs(),
                "Fatal error"
            );
            Err(err)
        }
    }
}
