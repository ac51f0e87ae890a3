//! Reqwest client module.
//!
//! This module provides the client shared by every HTTP integration, the
//! cache of peer connections and the endpoint addressing of peers.

mod client;
mod config;
mod peers;

pub(crate) use client::{send, send_leased};
pub use client::{IDEMPOTENCY_KEY_HEADER, PeerEndpoint, ReqwestClient, TRACING_TARGET};
pub use config::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_STRIPES, DEFAULT_TIMEOUT, ReqwestConfig};
pub use peers::{PeerCache, PeerLease};
