//! File-backed slots.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use conduit_core::{CHUNK_SIZE, ChunkStream, Error, Result};
use futures::{StreamExt, TryStreamExt};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

/// Streams `path` from `offset` in chunks of at most [`CHUNK_SIZE`] bytes.
pub(crate) async fn read_file(path: &Path, offset: u64) -> Result<ChunkStream> {
    let mut file = File::open(path).await?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await?;
    }

    Ok(ReaderStream::with_capacity(file, CHUNK_SIZE)
        .map_err(Error::from)
        .boxed())
}

enum SinkState {
    Idle,
    Writing(BufWriter<File>),
    Closed,
}

/// Sequential writer of one file, created on first write.
pub(crate) struct FileSink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

impl FileSink {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(SinkState::Idle),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    async fn create(&self) -> Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(BufWriter::new(File::create(&self.path).await?))
    }

    pub(crate) async fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;
        if matches!(*state, SinkState::Idle) {
            *state = SinkState::Writing(self.create().await?);
        }

        match &mut *state {
            SinkState::Writing(writer) => Ok(writer.write_all(data).await?),
            _ => Err(Error::invalid_state(format!(
                "file '{}' is closed for writing",
                self.path.display()
            ))),
        }
    }

    /// Flushes and closes the file. An untouched sink leaves an empty file.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SinkState::Closed) {
            SinkState::Writing(mut writer) => {
                writer.flush().await?;
                writer.shutdown().await?;
            }
            SinkState::Idle => {
                self.create().await?;
            }
            SinkState::Closed => {}
        }
        Ok(())
    }

    pub(crate) async fn remove(&self) -> Result<()> {
        *self.state.lock().await = SinkState::Closed;
        match tokio::fs::remove_file(&self.path).await {
            Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        }
    }
}

/// Input slot writing received bytes to a file the task reads.
pub struct FileInput {
    sink: FileSink,
}

impl FileInput {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            sink: FileSink::new(path),
        }
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

    pub(crate) async fn release(&self) -> Result<()> {
        self.sink.remove().await
    }
}

/// Output slot whose producer writes a temporary file.
pub struct FileOutput {
    sink: FileSink,
}

impl FileOutput {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self {
            sink: FileSink::new(path),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        self.sink.path()
    }

    pub(crate) async fn write(&self, data: Bytes) -> Result<()> {
        self.sink.write(&data).await
    }

    pub(crate) async fn close(&self) -> Result<()> {
        self.sink.close().await
    }

    pub(crate) async fn read(&self, offset: u64) -> Result<ChunkStream> {
        read_file(self.sink.path(), offset).await
    }

    pub(crate) async fn release(&self) -> Result<()> {
        self.sink.remove().await
    }
}

/// Output slot over an existing file named by a `local://` slot name.
///
/// The file is complete when the slot is created and is never removed.
pub struct LocalFileOutput {
    path: PathBuf,
}

impl LocalFileOutput {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn read(&self, offset: u64) -> Result<ChunkStream> {
        read_file(&self.path, offset).await
    }
}
