#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod allocator;
mod channel;
mod config;
mod frames;
mod operations;
mod pool;
mod registry;
mod relay;
mod resolver;
mod service;
mod slot;
mod snapshooter;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use allocator::{AllocatorClient, NoopAllocator};
pub use channel::{ChannelManager, LocalChannelManager, NoopChannelManager, SlotConnector};
pub use config::{DEFAULT_CLOSE_RECHECKS, DEFAULT_CLOSE_WAIT, DEFAULT_POOL_SIZE, SlotsConfig};
pub use frames::{chunks_from_frames, frames_from_chunks};
pub use operations::{OperationHandle, OperationService, Started};
pub use pool::WorkerPool;
pub use registry::{SlotRegistry, SlotRegistryBuilder};
pub use relay::RelayAgent;
pub use resolver::{SlotResolver, SlotTransport};
pub use service::{SlotService, SlotServiceBuilder};
pub use slot::{BackendContext, BoxedWriter, Slot, SlotBackend};
pub use snapshooter::{SnapshotStore, Snapshooter};

/// Tracing target for crate-wide events.
pub const TRACING_TARGET: &str = "conduit_slots";

/// Locks `mutex`, recovering the guard if a holder panicked.
///
/// Critical sections in this crate never leave shared state half-updated
/// across a panic point.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
