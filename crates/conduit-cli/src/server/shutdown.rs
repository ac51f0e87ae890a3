//! Termination signals.

use tokio_util::sync::CancellationToken;

use super::TRACING_TARGET_SHUTDOWN;

/// Cancels `shutdown` on SIGINT or SIGTERM.
///
/// Returns without cancelling if `shutdown` is cancelled first. A handler
/// that cannot be installed is logged and never fires.
pub async fn shutdown_signal(shutdown: CancellationToken) {
    let signal = tokio::select! {
        () = interrupt() => "SIGINT",
        () = terminate() => "SIGTERM",
        () = shutdown.cancelled() => return,
    };

    tracing::info!(
        target: TRACING_TARGET_SHUTDOWN,
        signal,
        "Stopping: draining requests, relay sessions and slots"
    );
    shutdown.cancel();
}

async fn interrupt() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(target: TRACING_TARGET_SHUTDOWN, %error, "Cannot listen for SIGINT");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(error) => {
            tracing::error!(target: TRACING_TARGET_SHUTDOWN, %error, "Cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_once_shutdown_is_cancelled_elsewhere() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        shutdown_signal(shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }
}
