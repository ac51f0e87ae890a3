//! HTTP server startup, allocator liveness and graceful shutdown.

/// Tracing target for server startup events.
pub const TRACING_TARGET_STARTUP: &str = "conduit_cli::server::startup";

/// Tracing target for server shutdown events.
pub const TRACING_TARGET_SHUTDOWN: &str = "conduit_cli::server::shutdown";

/// Tracing target for allocator reporting.
pub const TRACING_TARGET_HEARTBEAT: &str = "conduit_cli::server::heartbeat";

mod error;
mod heartbeat;
mod http_server;
mod lifecycle;
mod shutdown;

pub use error::{Result, ServerError};
pub use heartbeat::spawn_heartbeat;
pub use http_server::serve_http as serve;
pub use lifecycle::drain;
pub use shutdown::shutdown_signal;
