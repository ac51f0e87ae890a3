#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod backend;
mod config;
mod download;
mod error;
mod snapshot;

#[doc(hidden)]
pub mod prelude;

pub use backend::StorageBackend;
pub use config::{BackendType, StorageConfig};
pub use download::{DEFAULT_QUEUE_CAPACITY, pump};
pub use error::{StorageError, StorageResult};
pub use snapshot::{
    EntryStatus, InMemorySnapshotRegistry, SnapshotEntry, SnapshotRegistry, snapshot_key,
};

/// Tracing target for storage operations.
pub const TRACING_TARGET: &str = "conduit_storage";
