//! Prelude module for convenient imports.

pub use crate::backend::StorageBackend;
pub use crate::config::{BackendType, StorageConfig};
pub use crate::error::{StorageError, StorageResult};
pub use crate::snapshot::{InMemorySnapshotRegistry, SnapshotEntry, SnapshotRegistry};
