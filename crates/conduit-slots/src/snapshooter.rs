//! Snapshot storage for slots bound to `snapshot:<id>` channels.

use std::sync::Arc;

use conduit_core::{ChunkStream, Result, SlotState};
use conduit_storage::{
    InMemorySnapshotRegistry, SnapshotEntry, SnapshotRegistry, StorageBackend, snapshot_key,
};
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use crate::slot::Slot;

/// Tracing target for snapshot uploads.
pub const TRACING_TARGET: &str = "conduit_slots::snapshooter";

/// Object storage plus the registry of snapshot entries.
#[derive(Clone)]
pub struct SnapshotStore {
    storage: StorageBackend,
    registry: Arc<dyn SnapshotRegistry>,
}

impl SnapshotStore {
    /// Creates a store over `storage` recording entries in `registry`.
    pub fn new(storage: StorageBackend, registry: Arc<dyn SnapshotRegistry>) -> Self {
        Self { storage, registry }
    }

    /// Creates a store over in-memory storage and an in-memory registry.
    pub fn in_memory(bucket: impl Into<String>) -> Result<Self> {
        Ok(Self::new(
            StorageBackend::memory(bucket)?,
            Arc::new(InMemorySnapshotRegistry::new()),
        ))
    }

    /// Returns the storage backend.
    pub fn storage(&self) -> &StorageBackend {
        &self.storage
    }

    /// Creates a snapshot; ids are single use.
    pub async fn create_snapshot(&self, snapshot_id: &str) -> Result<()> {
        Ok(self.registry.create_snapshot(snapshot_id).await?)
    }

    /// Registers the entry of `slot_path` in a snapshot.
    pub async fn register(&self, snapshot_id: &str, slot_path: &str) -> Result<SnapshotEntry> {
        let location = self.storage.uri_for(&snapshot_key(snapshot_id, slot_path))?;
        Ok(self
            .registry
            .register_entry(snapshot_id, slot_path, location)
            .await?)
    }

    /// Returns a registered entry.
    pub async fn entry(&self, snapshot_id: &str, slot_path: &str) -> Result<SnapshotEntry> {
        Ok(self.registry.entry(snapshot_id, slot_path).await?)
    }

    /// Uploads the data of an entry.
    pub async fn upload(
        &self,
        snapshot_id: &str,
        slot_path: &str,
        chunks: ChunkStream,
    ) -> Result<u64> {
        Ok(self
            .storage
            .upload(&snapshot_key(snapshot_id, slot_path), chunks)
            .await?)
    }

    /// Commits an entry after its data was uploaded.
    pub async fn commit(
        &self,
        snapshot_id: &str,
        slot_path: &str,
        empty: bool,
    ) -> Result<SnapshotEntry> {
        Ok(self
            .registry
            .commit_entry(snapshot_id, slot_path, empty)
            .await?)
    }

    /// Streams the data of an entry from `offset`.
    pub async fn download(
        &self,
        snapshot_id: &str,
        slot_path: &str,
        offset: u64,
    ) -> Result<ChunkStream> {
        Ok(self
            .storage
            .download(&snapshot_key(snapshot_id, slot_path), offset)
            .await?)
    }
}

impl std::fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

/// Tees output slots into snapshot storage.
///
/// A tracked slot is uploaded once it opens and its entry is committed once it
/// is destroyed. A slot destroyed without ever opening commits an empty entry.
#[derive(Debug, Clone)]
pub struct Snapshooter {
    store: SnapshotStore,
    tracker: TaskTracker,
}

impl Snapshooter {
    /// Creates a snapshooter writing to `store`.
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            tracker: TaskTracker::new(),
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Registers the entry of a snapshot input slot.
    pub async fn register_input(&self, snapshot_id: &str, slot_path: &str) -> Result<()> {
        self.store.register(snapshot_id, slot_path).await?;
        Ok(())
    }

    /// Registers `slot` in `snapshot_id` and arranges its upload and commit.
    pub async fn track_output(&self, slot: &Arc<Slot>, snapshot_id: &str) -> Result<()> {
        self.store.register(snapshot_id, slot.name()).await?;

        tracing::info!(
            target: TRACING_TARGET,
            snapshot_id = %snapshot_id,
            task_id = %slot.task_id(),
            slot = %slot.name(),
            "Tracking slot for snapshot"
        );

        let (done_tx, done_rx) = oneshot::channel::<Result<u64>>();

        let weak = Arc::downgrade(slot);
        let store = self.store.clone();
        let id = snapshot_id.to_string();
        slot.on_state(SlotState::Open, move |state| {
            let Some(slot) = weak.upgrade() else { return };
            if state.is_terminal() {
                return;
            }

            let reader = Arc::clone(&slot);
            slot.spawn_attached(async move {
                let chunks = reader.read_from(0);
                let result = store.upload(&id, reader.name(), chunks).await;
                if let Err(error) = &result {
                    let failed = Arc::clone(&reader);
                    let error = error.detached();
                    tokio::spawn(async move { failed.fail(error).await });
                }
                let _ = done_tx.send(result);
            });
        });

        let store = self.store.clone();
        let tracker = self.tracker.clone();
        let id = snapshot_id.to_string();
        let slot_path = slot.name().to_string();
        slot.on_state(SlotState::Destroyed, move |_| {
            tracker.spawn(async move {
                let uploaded = match done_rx.await {
                    Ok(Ok(bytes)) => Ok(bytes),
                    Ok(Err(error)) => Err(error),
                    Err(_) => {
                        let empty = futures::stream::empty().boxed();
                        store.upload(&id, &slot_path, empty).await
                    }
                };

                let committed = match uploaded {
                    Ok(bytes) => store.commit(&id, &slot_path, bytes == 0).await,
                    Err(error) => Err(error),
                };

                match committed {
                    Ok(entry) => tracing::info!(
                        target: TRACING_TARGET,
                        snapshot_id = %id,
                        slot = %slot_path,
                        location = %entry.location,
                        empty = entry.empty,
                        "Snapshot entry committed"
                    ),
                    Err(error) => tracing::error!(
                        target: TRACING_TARGET,
                        snapshot_id = %id,
                        slot = %slot_path,
                        error = %error,
                        "Snapshot entry not committed"
                    ),
                }
            });
        });

        Ok(())
    }

    /// Waits for every pending commit.
    pub async fn close(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        tracing::debug!(target: TRACING_TARGET, "Snapshooter closed");
    }
}
