//! All `axum::`[`Router`]s with related `axum::`[`Handler`]s.
//!
//! # Usage Example
//!
//! ```rust,ignore
//! use conduit_server::handler::routes;
//! use conduit_server::service::{ServiceConfig, ServiceState};
//! use conduit_slots::{SlotService, SlotsConfig};
//!
//! let slots = SlotService::builder(SlotsConfig::default()).build()?;
//! let state = ServiceState::new(slots, ServiceConfig::default());
//! let app = routes().with_state(state);
//! ```
//!
//! [`Router`]: axum::routing::Router
//! [`Handler`]: axum::handler::Handler

mod channels;
mod error;
mod monitors;
mod operations;
mod progress;
mod relay;
mod request;
mod response;
mod slots;
mod snapshots;

use axum::Router;
use axum::response::{IntoResponse, Response};

pub use crate::handler::error::{Error, ErrorKind, Result};
pub use crate::handler::request::{
    ChannelPathParams, CreateSessionRequest, OperationPathParams, ProgressQuery,
    SessionPathParams, SnapshotPathParams, WaitQuery,
};
pub(crate) use crate::handler::response::ErrorResponse;
pub use crate::handler::response::{HealthResponse, SessionResponse};
pub use crate::handler::slots::FRAMED_CONTENT_TYPE;
use crate::service::ServiceState;

#[inline]
async fn handler() -> Response {
    ErrorKind::NotFound.into_response()
}

/// Returns a [`Router`] with every data-plane, channel and relay route.
pub fn routes() -> Router<ServiceState> {
    Router::new()
        .merge(slots::routes())
        .merge(operations::routes())
        .merge(channels::routes())
        .merge(snapshots::routes())
        .merge(progress::routes())
        .merge(relay::routes())
        .merge(monitors::routes())
        .fallback(handler)
}
