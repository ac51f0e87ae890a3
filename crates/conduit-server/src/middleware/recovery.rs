//! Request timeouts and panic recovery.

use std::any::Any;
use std::time::Duration;

use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::response::{IntoResponse, Response};
#[cfg(feature = "config")]
use clap::Args;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower::timeout::TimeoutLayer;
use tower::timeout::error::Elapsed;
use tower_http::catch_panic::CatchPanicLayer;

use crate::handler::ErrorKind;

const TRACING_TARGET: &str = "conduit_server::recovery";

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT: u64 = 90;

/// Configuration of the recovery middleware.
///
/// The timeout bounds the time until response headers are sent. Streamed
/// bodies (slot outputs, progress events) and upgraded websockets are not
/// bounded by it, and long polls cap themselves below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
#[must_use = "config does nothing unless you use it"]
pub struct RecoveryConfig {
    /// Seconds a handler may take to start answering.
    #[cfg_attr(
        feature = "config",
        arg(long, env = "REQUEST_TIMEOUT", default_value_t = DEFAULT_REQUEST_TIMEOUT)
    )]
    pub request_timeout: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::with_timeout_secs(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl RecoveryConfig {
    pub fn with_timeout_secs(secs: u64) -> Self {
        Self {
            request_timeout: secs,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Extension trait for `axum::`[`Router`] to apply recovery middleware.
pub trait RouterRecoveryExt<S> {
    /// Turns handler panics into 500s and slow handlers into 504s.
    fn with_recovery(self, config: &RecoveryConfig) -> Self;
}

impl<S> RouterRecoveryExt<S> for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_recovery(self, config: &RecoveryConfig) -> Self {
        let timeout = config.request_timeout();
        let middlewares = ServiceBuilder::new()
            .layer(HandleErrorLayer::new(move |err: tower::BoxError| async move {
                recover_error(err, timeout)
            }))
            .layer(CatchPanicLayer::custom(recover_panic))
            .layer(TimeoutLayer::new(timeout));

        self.layer(middlewares)
    }
}

fn recover_error(err: tower::BoxError, timeout: Duration) -> Response {
    if err.is::<Elapsed>() {
        tracing::warn!(
            target: TRACING_TARGET,
            timeout_secs = timeout.as_secs(),
            "Handler did not answer in time"
        );
        return ErrorKind::GatewayTimeout
            .with_message(format!("no response within {}s", timeout.as_secs()))
            .into_response();
    }

    tracing::error!(target: TRACING_TARGET, error = %err, "Middleware failed");
    ErrorKind::InternalServerError
        .with_context(err.to_string())
        .into_response()
}

fn recover_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let message = payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or("non-string panic payload");

    tracing::error!(target: TRACING_TARGET, panic = %message, "Handler panicked");
    ErrorKind::InternalServerError
        .with_message("handler panicked")
        .with_context(message.to_owned())
        .into_response()
}
