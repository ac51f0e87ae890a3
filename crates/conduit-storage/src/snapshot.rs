//! Snapshot entries: which storage object holds the data of a snapshot slot.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

use crate::TRACING_TARGET;
use crate::error::{StorageError, StorageResult};

/// Returns the object key of a slot within a snapshot.
pub fn snapshot_key(snapshot_id: &str, slot_path: &str) -> String {
    format!("{}/{}", snapshot_id, slot_path.trim_start_matches('/'))
}

/// Lifecycle of a snapshot entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Registered; data is being uploaded.
    Created,
    /// Data is fully stored.
    Committed,
}

/// One `(snapshotId, slotPath) -> location` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Snapshot the entry belongs to.
    pub snapshot_id: String,
    /// Slot path within the snapshot.
    pub slot_path: String,
    /// Storage location of the data.
    pub location: Url,
    /// Entry status.
    pub status: EntryStatus,
    /// Whether the committed object is empty.
    #[serde(default)]
    pub empty: bool,
    /// Registration time.
    pub created_at: Timestamp,
    /// Commit time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<Timestamp>,
}

/// Registry of snapshot entries.
///
/// A snapshot must be created before entries are registered, and each
/// `(snapshotId, slotPath)` pair may be registered at most once.
#[async_trait]
pub trait SnapshotRegistry: Send + Sync {
    /// Creates a snapshot. Fails with `AlreadyExists` if the id was used.
    async fn create_snapshot(&self, snapshot_id: &str) -> StorageResult<()>;

    /// Registers a new entry in `Created` status.
    async fn register_entry(
        &self,
        snapshot_id: &str,
        slot_path: &str,
        location: Url,
    ) -> StorageResult<SnapshotEntry>;

    /// Marks an entry as committed.
    async fn commit_entry(
        &self,
        snapshot_id: &str,
        slot_path: &str,
        empty: bool,
    ) -> StorageResult<SnapshotEntry>;

    /// Returns an entry.
    async fn entry(&self, snapshot_id: &str, slot_path: &str) -> StorageResult<SnapshotEntry>;
}

/// [`SnapshotRegistry`] kept in process memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotRegistry {
    snapshots: RwLock<HashMap<String, HashMap<String, SnapshotEntry>>>,
}

impl InMemorySnapshotRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotRegistry for InMemorySnapshotRegistry {
    async fn create_snapshot(&self, snapshot_id: &str) -> StorageResult<()> {
        let mut snapshots = self.snapshots.write().await;
        match snapshots.entry(snapshot_id.to_string()) {
            Entry::Occupied(_) => Err(StorageError::already_exists(format!(
                "snapshot '{snapshot_id}'"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(HashMap::new());
                tracing::debug!(
                    target: TRACING_TARGET,
                    snapshot_id = %snapshot_id,
                    "Snapshot created"
                );
                Ok(())
            }
        }
    }

    async fn register_entry(
        &self,
        snapshot_id: &str,
        slot_path: &str,
        location: Url,
    ) -> StorageResult<SnapshotEntry> {
        let mut snapshots = self.snapshots.write().await;
        let entries = snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| StorageError::not_found(format!("snapshot '{snapshot_id}'")))?;

        match entries.entry(slot_path.to_string()) {
            Entry::Occupied(_) => Err(StorageError::already_exists(format!(
                "entry '{slot_path}' of snapshot '{snapshot_id}'"
            ))),
            Entry::Vacant(vacant) => {
                let entry = SnapshotEntry {
                    snapshot_id: snapshot_id.to_string(),
                    slot_path: slot_path.to_string(),
                    location,
                    status: EntryStatus::Created,
                    empty: false,
                    created_at: Timestamp::now(),
                    committed_at: None,
                };

                tracing::debug!(
                    target: TRACING_TARGET,
                    snapshot_id = %snapshot_id,
                    slot_path = %slot_path,
                    location = %entry.location,
                    "Snapshot entry registered"
                );

                Ok(vacant.insert(entry).clone())
            }
        }
    }

    async fn commit_entry(
        &self,
        snapshot_id: &str,
        slot_path: &str,
        empty: bool,
    ) -> StorageResult<SnapshotEntry> {
        let mut snapshots = self.snapshots.write().await;
        let entry = snapshots
            .get_mut(snapshot_id)
            .and_then(|entries| entries.get_mut(slot_path))
            .ok_or_else(|| {
                StorageError::not_found(format!("entry '{slot_path}' of snapshot '{snapshot_id}'"))
            })?;

        entry.status = EntryStatus::Committed;
        entry.empty = empty;
        entry.committed_at = Some(Timestamp::now());

        tracing::debug!(
            target: TRACING_TARGET,
            snapshot_id = %snapshot_id,
            slot_path = %slot_path,
            empty = empty,
            "Snapshot entry committed"
        );

        Ok(entry.clone())
    }

    async fn entry(&self, snapshot_id: &str, slot_path: &str) -> StorageResult<SnapshotEntry> {
        self.snapshots
            .read()
            .await
            .get(snapshot_id)
            .and_then(|entries| entries.get(slot_path))
            .cloned()
            .ok_or_else(|| {
                StorageError::not_found(format!("entry '{slot_path}' of snapshot '{snapshot_id}'"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(path: &str) -> Url {
        Url::parse(&format!("memory://bucket/{path}")).unwrap()
    }

    #[test]
    fn key_strips_leading_slash() {
        assert_eq!(snapshot_key("snap-1", "/out/data"), "snap-1/out/data");
        assert_eq!(snapshot_key("snap-1", "out"), "snap-1/out");
    }

    #[tokio::test]
    async fn snapshot_ids_are_unique() -> anyhow::Result<()> {
        let registry = InMemorySnapshotRegistry::new();
        registry.create_snapshot("snap-1").await?;
        let second = registry.create_snapshot("snap-1").await;
        assert!(matches!(second, Err(StorageError::AlreadyExists(_))));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_entry_leaves_first_untouched() -> anyhow::Result<()> {
        let registry = InMemorySnapshotRegistry::new();
        registry.create_snapshot("snap-1").await?;

        let first = registry
            .register_entry("snap-1", "/out", location("snap-1/out"))
            .await?;
        let second = registry
            .register_entry("snap-1", "/out", location("elsewhere"))
            .await;
        assert!(matches!(second, Err(StorageError::AlreadyExists(_))));

        assert_eq!(registry.entry("snap-1", "/out").await?, first);
        Ok(())
    }

    #[tokio::test]
    async fn entry_requires_snapshot() {
        let registry = InMemorySnapshotRegistry::new();
        let result = registry
            .register_entry("missing", "/out", location("missing/out"))
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn commit_marks_entry() -> anyhow::Result<()> {
        let registry = InMemorySnapshotRegistry::new();
        registry.create_snapshot("snap-1").await?;
        registry
            .register_entry("snap-1", "/out", location("snap-1/out"))
            .await?;

        let committed = registry.commit_entry("snap-1", "/out", true).await?;
        assert_eq!(committed.status, EntryStatus::Committed);
        assert!(committed.empty);
        assert!(committed.committed_at.is_some());
        Ok(())
    }
}
