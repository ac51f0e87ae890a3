//! Storage-backed snapshot slots.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use conduit_core::{ChunkStream, Error, Result};

use super::file::{FileSink, read_file};
use crate::snapshooter::SnapshotStore;

/// Splits a `snapshot://<snapshotId>/<slotPath>` name path into its parts.
pub(crate) fn parse_snapshot_name(name_path: &str) -> Result<(String, String)> {
    match name_path.split_once('/') {
        Some((id, path)) if !id.is_empty() && !path.is_empty() => {
            Ok((id.to_string(), format!("/{path}")))
        }
        _ => Err(Error::invalid_input(format!(
            "snapshot slot name '{name_path}' must be '<snapshotId>/<slotPath>'"
        ))),
    }
}

/// Input slot accumulating bytes locally, uploaded and committed on destroy.
pub struct SnapshotInput {
    store: SnapshotStore,
    snapshot_id: String,
    slot_path: String,
    sink: FileSink,
}

impl SnapshotInput {
    pub(crate) fn new(
        store: SnapshotStore,
        snapshot_id: String,
        slot_path: String,
        spool: PathBuf,
    ) -> Self {
        Self {
            store,
            snapshot_id,
            slot_path,
            sink: FileSink::new(spool),
        }
    }

    pub(crate) fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    pub(crate) fn slot_path(&self) -> &str {
        &self.slot_path
    }

    pub(crate) fn path(&self) -> &Path {
        self.sink.path()
    }

    pub(crate) async fn accept(&self, data: Bytes) -> Result<()> {
        self.sink.write(&data).await
    }

    pub(crate) async fn finish(&self) -> Result<()> {
        self.sink.close().await
    }

    /// Uploads the spooled bytes and commits the snapshot entry.
    pub(crate) async fn release(&self) -> Result<()> {
        self.sink.close().await?;

        let result = async {
            let chunks = read_file(self.sink.path(), 0).await?;
            let uploaded = self
                .store
                .upload(&self.snapshot_id, &self.slot_path, chunks)
                .await?;
            self.store
                .commit(&self.snapshot_id, &self.slot_path, uploaded == 0)
                .await?;
            Ok::<_, Error>(())
        }
        .await;

        self.sink.remove().await?;
        result.map_err(|error| {
            Error::new(error.kind())
                .with_message(format!(
                    "cannot commit '{}' to snapshot '{}': {}",
                    self.slot_path,
                    self.snapshot_id,
                    error.message_or_kind()
                ))
                .with_source(error)
        })
    }
}

/// Output slot serving a committed snapshot object.
pub struct SnapshotOutput {
    store: SnapshotStore,
    snapshot_id: String,
    slot_path: String,
}

impl SnapshotOutput {
    pub(crate) fn new(store: SnapshotStore, snapshot_id: String, slot_path: String) -> Self {
        Self {
            store,
            snapshot_id,
            slot_path,
        }
    }

    pub(crate) async fn read(&self, offset: u64) -> Result<ChunkStream> {
        self.store
            .download(&self.snapshot_id, &self.slot_path, offset)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names_split_into_id_and_path() -> Result<()> {
        let (id, path) = parse_snapshot_name("snap-1/out/data")?;
        assert_eq!(id, "snap-1");
        assert_eq!(path, "/out/data");

        assert!(parse_snapshot_name("snap-1").is_err());
        assert!(parse_snapshot_name("/out").is_err());
        Ok(())
    }
}
