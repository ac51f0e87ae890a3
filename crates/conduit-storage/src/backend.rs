//! Storage backend implementation.

use bytes::Bytes;
use conduit_core::{CHUNK_SIZE, ChunkStream, STORAGE_SCHEMES};
use futures::{StreamExt, TryStreamExt};
use opendal::{Operator, services};
use url::Url;

use crate::TRACING_TARGET;
use crate::config::{BackendType, StorageConfig};
use crate::download::{DEFAULT_QUEUE_CAPACITY, pump};
use crate::error::{StorageError, StorageResult};

/// Unified storage backend that wraps an OpenDAL operator.
#[derive(Clone)]
pub struct StorageBackend {
    operator: Operator,
    config: StorageConfig,
    queue_capacity: usize,
}

impl StorageBackend {
    /// Creates a new storage backend from configuration.
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        let operator = Self::create_operator(&config)?;

        tracing::info!(
            target: TRACING_TARGET,
            backend = %config.backend_type,
            root = %config.root,
            "Storage backend initialized"
        );

        Ok(Self {
            operator,
            config,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }

    /// Creates an in-memory backend, mostly useful in tests.
    pub fn memory(bucket: impl Into<String>) -> StorageResult<Self> {
        Self::new(StorageConfig::memory(bucket))
    }

    /// Overrides the number of chunks buffered by [`StorageBackend::download`].
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Returns the configuration for this backend.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Returns the backend type.
    pub fn backend_type(&self) -> BackendType {
        self.config.backend_type
    }

    /// Reads a whole object.
    pub async fn read(&self, path: &str) -> StorageResult<Bytes> {
        let data = self.operator.read(path).await?.to_bytes();

        tracing::debug!(
            target: TRACING_TARGET,
            path = %path,
            size = data.len(),
            "Object read complete"
        );

        Ok(data)
    }

    /// Writes a whole object.
    pub async fn write(&self, path: &str, data: impl Into<Bytes>) -> StorageResult<()> {
        let data = data.into();
        let size = data.len();
        self.operator.write(path, data).await?;

        tracing::debug!(
            target: TRACING_TARGET,
            path = %path,
            size = size,
            "Object write complete"
        );

        Ok(())
    }

    /// Uploads a chunk stream as one object and returns the number of bytes written.
    pub async fn upload(&self, path: &str, mut chunks: ChunkStream) -> StorageResult<u64> {
        let mut writer = self.operator.writer(path).await?;
        let mut written = 0u64;

        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(error) => {
                    let _ = writer.abort().await;
                    return Err(StorageError::write(error.to_string()));
                }
            };
            written += chunk.len() as u64;
            writer.write(chunk).await?;
        }
        writer.close().await?;

        tracing::debug!(
            target: TRACING_TARGET,
            path = %path,
            size = written,
            "Object upload complete"
        );

        Ok(written)
    }

    /// Deletes an object.
    pub async fn delete(&self, path: &str) -> StorageResult<()> {
        self.operator.delete(path).await?;

        tracing::debug!(
            target: TRACING_TARGET,
            path = %path,
            "Object deleted"
        );

        Ok(())
    }

    /// Checks if an object exists.
    pub async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.operator.exists(path).await?)
    }

    /// Streams an object starting at `offset`.
    ///
    /// The transfer runs on a background task and is rechunked into
    /// [`CHUNK_SIZE`] pieces. At most the configured queue capacity of chunks is
    /// buffered; dropping the returned stream stops the transfer.
    pub async fn download(&self, path: &str, offset: u64) -> StorageResult<ChunkStream> {
        let reader = self.operator.reader(path).await?;
        let source = reader
            .into_bytes_stream(offset..)
            .await?
            .map_err(conduit_core::Error::from);

        tracing::debug!(
            target: TRACING_TARGET,
            path = %path,
            offset = offset,
            "Object download started"
        );

        Ok(pump(source, self.queue_capacity, CHUNK_SIZE))
    }

    /// Returns the location URI of an object in this backend.
    pub fn uri_for(&self, path: &str) -> StorageResult<Url> {
        let location = format!(
            "{}://{}/{}",
            self.config.backend_type.scheme(),
            self.config.bucket(),
            path.trim_start_matches('/')
        );
        Url::parse(&location).map_err(|e| StorageError::invalid_path(e.to_string()))
    }

    /// Returns the object path of a location URI produced by [`StorageBackend::uri_for`].
    pub fn path_of(&self, location: &Url) -> StorageResult<String> {
        if !STORAGE_SCHEMES.contains(&location.scheme()) {
            return Err(StorageError::invalid_path(format!(
                "'{location}' is not a storage location"
            )));
        }
        if location.host_str() != Some(self.config.bucket()) {
            return Err(StorageError::invalid_path(format!(
                "'{location}' is outside bucket '{}'",
                self.config.bucket()
            )));
        }

        let path = location.path().trim_start_matches('/');
        if path.is_empty() {
            return Err(StorageError::invalid_path(format!(
                "'{location}' has no object key"
            )));
        }
        Ok(path.to_string())
    }

    /// Creates an OpenDAL operator based on configuration.
    fn create_operator(config: &StorageConfig) -> StorageResult<Operator> {
        match config.backend_type {
            BackendType::Memory => Operator::new(services::Memory::default())
                .map(|op| op.finish())
                .map_err(|e| StorageError::init(e.to_string())),

            BackendType::Fs => Operator::new(services::Fs::default().root(&config.root))
                .map(|op| op.finish())
                .map_err(|e| StorageError::init(e.to_string())),

            #[cfg(feature = "s3")]
            BackendType::S3 => {
                let mut builder = services::S3::default().bucket(&config.root);

                if let Some(ref region) = config.region {
                    builder = builder.region(region);
                }

                if let Some(ref endpoint) = config.endpoint {
                    builder = builder.endpoint(endpoint);
                }

                if let Some(ref access_key_id) = config.access_key_id {
                    builder = builder.access_key_id(access_key_id);
                }

                if let Some(ref secret_access_key) = config.secret_access_key {
                    builder = builder.secret_access_key(secret_access_key);
                }

                Operator::new(builder)
                    .map(|op| op.finish())
                    .map_err(|e| StorageError::init(e.to_string()))
            }

            #[cfg(not(feature = "s3"))]
            BackendType::S3 => Err(StorageError::init(
                "s3 backend requires the `s3` feature",
            )),
        }
    }
}

impl std::fmt::Debug for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageBackend")
            .field("backend_type", &self.config.backend_type)
            .field("root", &self.config.root)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn download_resumes_from_offset() -> anyhow::Result<()> {
        let backend = StorageBackend::memory("bucket")?;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        backend.write("snap/out", data.clone()).await?;

        let chunks: Vec<Bytes> = backend.download("snap/out", 5000).await?.try_collect().await?;
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_SIZE));
        assert_eq!(chunks[0].len(), CHUNK_SIZE);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data[5000..]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_object_is_not_found() -> anyhow::Result<()> {
        let backend = StorageBackend::memory("bucket")?;
        let result = backend.download("snap/missing", 0).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn upload_collects_stream() -> anyhow::Result<()> {
        let backend = StorageBackend::memory("bucket")?;
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"hel")),
            Ok(Bytes::from_static(b"lo\n")),
        ])
        .boxed();

        assert_eq!(backend.upload("snap/out", chunks).await?, 6);
        assert_eq!(backend.read("snap/out").await?, Bytes::from_static(b"hello\n"));
        Ok(())
    }

    #[tokio::test]
    async fn fs_backend_stores_under_root() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let backend = StorageBackend::new(StorageConfig::fs(root))?;

        backend.write("snap-1/out", Bytes::from_static(b"hello\n")).await?;
        assert!(backend.exists("snap-1/out").await?);
        assert!(dir.path().join("snap-1/out").exists());

        backend.delete("snap-1/out").await?;
        assert!(!backend.exists("snap-1/out").await?);
        Ok(())
    }

    #[test]
    fn locations_round_trip_through_paths() -> anyhow::Result<()> {
        let backend = StorageBackend::memory("bucket")?;
        let location = backend.uri_for("/snap-1/out")?;
        assert_eq!(location.as_str(), "memory://bucket/snap-1/out");
        assert_eq!(backend.path_of(&location)?, "snap-1/out");

        let foreign = Url::parse("memory://other/snap-1/out")?;
        assert!(backend.path_of(&foreign).is_err());
        Ok(())
    }
}
