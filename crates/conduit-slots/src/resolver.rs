//! Resolution of slot URIs into lazy chunk streams.

use std::sync::Arc;

use async_trait::async_trait;
use conduit_core::{ChunkStream, Error, Result, SlotUri, UriKind};
use conduit_storage::StorageBackend;
use futures::StreamExt;

use crate::registry::SlotRegistry;

/// Tracing target for URI resolution.
pub const TRACING_TARGET: &str = "conduit_slots::resolver";

/// Opens output slots served by other nodes.
#[async_trait]
pub trait SlotTransport: Send + Sync {
    /// Issues `openOutputSlot` against the node serving `uri`.
    async fn open_output(&self, uri: &SlotUri, offset: u64) -> Result<ChunkStream>;
}

/// Resolves a slot URI into the bytes it carries, starting at an offset.
///
/// Storage URIs are downloaded, URIs of this node are read from the local
/// registry, and anything else goes through the [`SlotTransport`]. Nothing
/// is opened before the first chunk is pulled, and failures end the stream
/// without retry.
#[derive(Clone)]
pub struct SlotResolver {
    registry: SlotRegistry,
    transport: Option<Arc<dyn SlotTransport>>,
    storage: Option<StorageBackend>,
}

impl SlotResolver {
    /// Creates a resolver that only reads slots of `registry`.
    pub fn new(registry: SlotRegistry) -> Self {
        let storage = registry.snapshots().map(|store| store.storage().clone());
        Self {
            registry,
            transport: None,
            storage,
        }
    }

    /// Reaches remote slots through `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn SlotTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Downloads storage URIs from `storage`.
    pub fn with_storage(mut self, storage: StorageBackend) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Returns the chunks of `uri` starting at `offset`.
    pub fn resolve(&self, uri: &SlotUri, offset: u64) -> ChunkStream {
        let resolver = self.clone();
        let uri = uri.clone();
        let stream = async_stream::try_stream! {
            let mut chunks = resolver.open(&uri, offset).await?;
            while let Some(chunk) = chunks.next().await {
                yield chunk?;
            }
        };

        stream.boxed()
    }

    async fn open(&self, uri: &SlotUri, offset: u64) -> Result<ChunkStream> {
        let kind = uri.kind().ok_or_else(|| {
            Error::invalid_input(format!("unsupported scheme '{}' in '{uri}'", uri.scheme()))
        })?;

        tracing::debug!(
            target: TRACING_TARGET,
            uri = %uri,
            offset = offset,
            kind = ?kind,
            "Resolving slot uri"
        );

        match kind {
            UriKind::Storage => {
                let storage = self.storage.as_ref().ok_or_else(|| {
                    Error::invalid_input(format!("no storage configured to resolve '{uri}'"))
                })?;
                let path = storage.path_of(uri.as_url())?;
                Ok(storage.download(&path, offset).await?)
            }
            UriKind::Peer if self.registry.is_local(uri) => {
                let slot = self.registry.get(uri.task_id(), uri.slot_name())?;
                if !slot.spec().is_output() {
                    return Err(Error::not_found(format!("'{uri}' is not an output slot")));
                }
                Ok(slot.read_from(offset))
            }
            UriKind::Peer | UriKind::Relay => {
                let transport = self.transport.as_ref().ok_or_else(|| {
                    Error::invalid_input(format!("no transport configured to resolve '{uri}'"))
                })?;
                transport.open_output(uri, offset).await
            }
        }
    }
}

impl std::fmt::Debug for SlotResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotResolver")
            .field("registry", &self.registry)
            .field("transport", &self.transport.is_some())
            .field("storage", &self.storage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use conduit_core::{ErrorKind, SlotDirection, SlotMedia, SlotSpec};
    use futures::TryStreamExt;
    use url::Url;

    use super::*;

    #[derive(Default)]
    struct CountingTransport {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl SlotTransport for CountingTransport {
        async fn open_output(&self, _uri: &SlotUri, offset: u64) -> Result<ChunkStream> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let data = Bytes::from_static(b"remote bytes");
            Ok(futures::stream::iter(vec![Ok(data.slice(offset as usize..))]).boxed())
        }
    }

    fn registry(dir: &std::path::Path) -> anyhow::Result<SlotRegistry> {
        Ok(SlotRegistry::builder(Url::parse("fs://127.0.0.1:9000")?, dir).build())
    }

    #[tokio::test]
    async fn remote_open_is_deferred_until_first_pull() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let transport = Arc::new(CountingTransport::default());
        let resolver = SlotResolver::new(registry(dir.path())?).with_transport(transport.clone());

        let uri = SlotUri::parse("fs://10.0.0.7:9000/t1/out")?;
        let stream = resolver.resolve(&uri, 7);
        assert_eq!(transport.opened.load(Ordering::SeqCst), 0);

        let chunks: Vec<Bytes> = stream.try_collect().await?;
        assert_eq!(chunks.concat(), b"bytes");
        assert_eq!(transport.opened.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn local_uris_read_the_registry() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = registry(dir.path())?;
        let slot = registry
            .create("t1", SlotSpec::new("/out", SlotMedia::File, SlotDirection::Output), "")
            .await?;
        slot.write(Bytes::from_static(b"hello\n")).await?;
        slot.close_writer().await?;

        let resolver = SlotResolver::new(registry.clone());
        let chunks: Vec<Bytes> = resolver.resolve(slot.uri(), 2).try_collect().await?;
        assert_eq!(chunks.concat(), b"llo\n");

        let missing = SlotUri::parse("fs://127.0.0.1:9000/t1/missing")?;
        let result: Result<Vec<Bytes>> = resolver.resolve(&missing, 0).try_collect().await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn storage_uris_are_downloaded() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = StorageBackend::memory("bucket")?;
        storage.write("s1/out", Bytes::from_static(b"stored")).await?;

        let resolver = SlotResolver::new(registry(dir.path())?).with_storage(storage);
        let uri = SlotUri::parse("memory://bucket/s1/out")?;
        let chunks: Vec<Bytes> = resolver.resolve(&uri, 3).try_collect().await?;
        assert_eq!(chunks.concat(), b"red");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_scheme_is_invalid_input() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let resolver = SlotResolver::new(registry(dir.path())?);
        let uri = SlotUri::parse("gopher://host/t1/out")?;
        let result: Result<Vec<Bytes>> = resolver.resolve(&uri, 0).try_collect().await;
        assert_eq!(result.err().map(|e| e.kind()), Some(ErrorKind::InvalidInput));
        Ok(())
    }
}
