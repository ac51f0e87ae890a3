//! Extension trait for `axum::Router` applying the server's middleware stacks.

use axum::Router;

use crate::middleware::observability::RouterObservabilityExt;
use crate::middleware::recovery::{RecoveryConfig, RouterRecoveryExt};

/// Extension trait for `axum::`[`Router`] for layering middleware.
pub trait RouterExt<S> {
    /// Layers timeout, panic and middleware error recovery.
    fn with_error_handling_layer(self, config: &RecoveryConfig) -> Self;

    /// Layers request ids, tracing spans and request logs.
    fn with_observability_layer(self) -> Self;
}

impl<S> RouterExt<S> for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_error_handling_layer(self, config: &RecoveryConfig) -> Self {
        self.with_recovery(config)
    }

    fn with_observability_layer(self) -> Self {
        // Apply layers in reverse order (last layer wraps first)
        self.with_request_logging().with_observability()
    }
}
