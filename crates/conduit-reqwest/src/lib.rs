//! Reqwest-based HTTP implementations of the conduit collaborator traits.
//!
//! This crate lets a node talk to the rest of the data plane over HTTP:
//!
//! - [`ReqwestClient`] implements `SlotTransport`, streaming remote output
//!   slots, and `SlotConnector`, starting transfers on remote input slots.
//! - [`SlotsClient`] calls the full slot API of one peer.
//! - [`HttpChannelManager`] and [`HttpAllocator`] reach the channel manager
//!   and the allocator.
//!
//! Peer connections are reference counted: a connection is opened on first
//! use and closed when its last user releases it.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_reqwest::{ReqwestClient, ReqwestConfig};
//! use conduit_slots::{SlotService, SlotsConfig};
//!
//! let client = ReqwestClient::new(ReqwestConfig::default())?;
//! let service = SlotService::builder(SlotsConfig::default())
//!     .with_transport(Arc::new(client.clone()))
//!     .with_remote_connector(Arc::new(client))
//!     .build()?;
//! ```

#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod connect;
mod error;
mod service;

pub use crate::connect::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_STRIPES, DEFAULT_TIMEOUT, IDEMPOTENCY_KEY_HEADER, PeerCache,
    PeerEndpoint, PeerLease, ReqwestClient, ReqwestConfig, TRACING_TARGET,
};
pub use crate::error::{Error, Result};
pub use crate::service::{HttpAllocator, HttpChannelManager, SlotsClient};
