//! Data-plane collaborators implemented over HTTP.
//!
//! This module implements the `conduit-slots` seams for [`ReqwestClient`]:
//! streaming reads from peers, the peer slot API, the remote channel
//! manager and the allocator.
//!
//! [`ReqwestClient`]: crate::ReqwestClient

mod allocator;
mod channels;
mod slots;
mod transport;

pub use allocator::HttpAllocator;
pub use channels::HttpChannelManager;
pub use slots::SlotsClient;
