//! Observability middleware: request ids, tracing spans and request logs.

use std::time::Instant;

use axum::Router;
use axum::extract::Request;
use axum::http::header;
use axum::middleware::{Next, from_fn};
use axum::response::Response;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::sensitive_headers::SetSensitiveRequestHeadersLayer;
use tower_http::trace::TraceLayer;

/// Tracing target for request logs.
const TRACING_TARGET: &str = "conduit_server::requests";

/// Header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extension trait for `axum::`[`Router`] to apply observability middleware.
pub trait RouterObservabilityExt<S> {
    /// Layers request ids, a tracing span per request and sensitive
    /// header redaction.
    fn with_observability(self) -> Self;

    /// Layers a middleware logging each request with its route group,
    /// status and duration.
    fn with_request_logging(self) -> Self;
}

impl<S> RouterObservabilityExt<S> for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_observability(self) -> Self {
        self.layer(PropagateRequestIdLayer::new(
            header::HeaderName::from_static(REQUEST_ID_HEADER),
        ))
        .layer(SetSensitiveRequestHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
        ]))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            MakeRequestUuid,
        ))
    }

    fn with_request_logging(self) -> Self {
        self.layer(from_fn(log_request))
    }
}

/// Groups a request path by the resource it addresses.
fn route_group(path: &str) -> &'static str {
    let mut segments = path.trim_start_matches('/').split('/');
    match (segments.next(), segments.nth(1), segments.next()) {
        (Some("relay"), Some(_), Some("slots")) => "relay_slots",
        (Some("relay"), Some(_), Some("control" | "data")) => "relay_channels",
        (Some("relay"), _, _) => "relay_sessions",
        (Some("slots"), _, _) => "slots",
        (Some("operations"), _, _) => "operations",
        (Some("channels"), _, _) => "channels",
        (Some("snapshots"), _, _) => "snapshots",
        (Some("progress"), _, _) => "progress",
        (Some("health"), _, _) => "health",
        _ => "other",
    }
}

/// Logs the start and completion of each request.
pub async fn log_request(request: Request, next: Next) -> Response {
    let start_time = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let group = route_group(uri.path());

    tracing::trace!(
        target: TRACING_TARGET,
        method = %method,
        uri = %uri,
        group = group,
        "request started"
    );

    let response = next.run(request).await;
    let status = response.status();
    let duration_ms = start_time.elapsed().as_millis() as u64;

    if status.is_server_error() {
        tracing::warn!(
            target: TRACING_TARGET,
            method = %method,
            uri = %uri,
            group = group,
            status = %status,
            duration_ms,
            "request failed"
        );
    } else {
        tracing::debug!(
            target: TRACING_TARGET,
            method = %method,
            uri = %uri,
            group = group,
            status = %status,
            duration_ms,
            "request completed"
        );
    }

    response
}
