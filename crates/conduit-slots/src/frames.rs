//! Conversion between chunk streams and EOS-terminated frame streams.

use bytes::Bytes;
use conduit_core::{ChunkStream, Error, Result, SlotFrame};
use futures::{Stream, StreamExt};

/// Frames `chunks`, ending with [`SlotFrame::Eos`] on success or
/// [`SlotFrame::Error`] on the first failure.
pub fn frames_from_chunks(chunks: ChunkStream) -> impl Stream<Item = SlotFrame> + Send + 'static {
    async_stream::stream! {
        let mut chunks = chunks;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => yield SlotFrame::Chunk(chunk),
                Err(error) => {
                    yield SlotFrame::Error(error.message_or_kind().to_string());
                    return;
                }
            }
        }
        yield SlotFrame::Eos;
    }
}

/// Unframes a frame stream into chunks.
///
/// [`SlotFrame::Eos`] ends the stream and is never delivered as payload. A
/// stream that ends without it is reported as truncated.
pub fn chunks_from_frames<S>(frames: S, source: impl Into<String>) -> ChunkStream
where
    S: Stream<Item = Result<SlotFrame>> + Send + 'static,
{
    let source = source.into();
    let stream = async_stream::try_stream! {
        let mut frames = std::pin::pin!(frames);
        let mut finished = false;
        while let Some(frame) = frames.next().await {
            match frame? {
                SlotFrame::Chunk(chunk) => yield chunk,
                SlotFrame::Eos => {
                    finished = true;
                    break;
                }
                SlotFrame::Error(message) => {
                    Err(Error::transient(format!("{source}: {message}")))?;
                }
            }
        }

        if !finished {
            Err(Error::transient(format!("{source}: stream truncated before end of stream")))?;
        }
    };

    Box::pin(stream) as std::pin::Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use futures::stream;

    use super::*;

    #[tokio::test]
    async fn eos_is_not_payload() -> Result<()> {
        let frames = stream::iter(vec![
            Ok(SlotFrame::Chunk(Bytes::from_static(b"hello\n"))),
            Ok(SlotFrame::Eos),
            Ok(SlotFrame::Chunk(Bytes::from_static(b"ignored"))),
        ]);

        let chunks: Vec<Bytes> = chunks_from_frames(frames, "fs://peer/t1/out")
            .try_collect()
            .await?;
        assert_eq!(chunks, vec!["hello\n"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_eos_is_truncation() {
        let frames = stream::iter(vec![Ok(SlotFrame::Chunk(Bytes::from_static(b"par")))]);
        let result: Result<Vec<Bytes>> = chunks_from_frames(frames, "peer").try_collect().await;
        assert!(result.is_err_and(|e| e.to_string().contains("truncated")));
    }

    #[tokio::test]
    async fn producer_errors_end_framing() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(Error::backend("disk full")),
            Ok(Bytes::from_static(b"b")),
        ])
        .boxed();

        let frames: Vec<SlotFrame> = frames_from_chunks(chunks).collect().await;
        assert_eq!(
            frames,
            vec![
                SlotFrame::Chunk(Bytes::from_static(b"a")),
                SlotFrame::Error("disk full".to_string()),
            ]
        );
    }
}
