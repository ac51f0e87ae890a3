//! Bounded producer/consumer transfer of chunk streams.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use conduit_core::{ChunkStream, Result};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::wrappers::ReceiverStream;

use crate::TRACING_TARGET;

/// Default number of chunks buffered between a download and its reader.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// How long the producer waits on a full queue before checking the reader again.
const SEND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Drains `source` on a background task into a queue of at most `capacity`
/// chunks of `chunk_size` bytes.
///
/// The producer blocks while the queue is full and stops as soon as the
/// returned stream is dropped. A source error is forwarded and ends the
/// transfer.
pub fn pump<S>(source: S, capacity: usize, chunk_size: usize) -> ChunkStream
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(produce(source, tx, chunk_size.max(1)));
    ReceiverStream::new(rx).boxed()
}

async fn produce<S>(source: S, tx: mpsc::Sender<Result<Bytes>>, chunk_size: usize)
where
    S: Stream<Item = Result<Bytes>> + Send,
{
    let mut source = std::pin::pin!(source);
    let mut pending = BytesMut::new();

    while let Some(item) = source.next().await {
        let bytes = match item {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    error = %error,
                    "Download source failed"
                );
                deliver(&tx, Err(error)).await;
                return;
            }
        };

        pending.extend_from_slice(&bytes);
        while pending.len() >= chunk_size {
            let chunk = pending.split_to(chunk_size).freeze();
            if !deliver(&tx, Ok(chunk)).await {
                return;
            }
        }
    }

    if !pending.is_empty() {
        deliver(&tx, Ok(pending.freeze())).await;
    }
}

/// Returns `false` once the reader is gone.
async fn deliver(tx: &mpsc::Sender<Result<Bytes>>, mut item: Result<Bytes>) -> bool {
    loop {
        match tx.send_timeout(item, SEND_RETRY_INTERVAL).await {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => {
                if tx.is_closed() {
                    return false;
                }
                tracing::trace!(target: TRACING_TARGET, "Download queue full, waiting");
                item = returned;
            }
            Err(SendTimeoutError::Closed(_)) => {
                tracing::debug!(target: TRACING_TARGET, "Download reader dropped");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::TryStreamExt;
    use futures::stream;

    use super::*;

    fn counted_source(counter: Arc<AtomicUsize>) -> impl Stream<Item = Result<Bytes>> + Send {
        stream::repeat_with(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from_static(&[7u8; 16]))
        })
    }

    #[tokio::test]
    async fn rechunks_to_fixed_size() -> anyhow::Result<()> {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"defgh")),
            Ok(Bytes::from_static(b"ij")),
        ]);

        let chunks: Vec<Bytes> = pump(source, 8, 4).try_collect().await?;
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
        Ok(())
    }

    #[tokio::test]
    async fn producer_blocks_at_capacity_and_resumes() -> anyhow::Result<()> {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut chunks = pump(counted_source(counter.clone()), 4, 16);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let blocked_at = counter.load(Ordering::SeqCst);
        // four queued, one held by the blocked send, one being polled
        assert!(blocked_at <= 6, "producer ran ahead: {blocked_at}");

        for _ in 0..4 {
            chunks.next().await.transpose()?;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let resumed_at = counter.load(Ordering::SeqCst);
        assert!(resumed_at > blocked_at);
        assert!(resumed_at <= blocked_at + 4 + 1);
        Ok(())
    }

    #[tokio::test]
    async fn dropping_reader_stops_producer() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chunks = pump(counted_source(counter.clone()), 2, 16);
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(chunks);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped_at = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn source_error_ends_stream() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(conduit_core::Error::transient("connection reset")),
            Ok(Bytes::from_static(b"efgh")),
        ]);

        let items: Vec<_> = pump(source, 8, 4).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }
}
