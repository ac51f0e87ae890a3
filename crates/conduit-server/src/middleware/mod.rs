//! Middleware for `axum::Router`: recovery and observability.
//!
//! ```rust,no_run
//! use axum::Router;
//! use conduit_server::middleware::{RecoveryConfig, RouterExt};
//!
//! let app: Router = Router::new()
//!     .with_error_handling_layer(&RecoveryConfig::default())
//!     .with_observability_layer();
//! ```

mod extensions;
mod observability;
mod recovery;

pub use extensions::RouterExt;
pub use observability::{REQUEST_ID_HEADER, RouterObservabilityExt, log_request};
pub use recovery::{RecoveryConfig, RouterRecoveryExt};
