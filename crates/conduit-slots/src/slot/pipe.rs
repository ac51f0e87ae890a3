//! Pipe slots: sequential byte streams such as stdin, stdout and stderr.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use conduit_core::{ChunkStream, Error, Result};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::lock;

/// Size of the in-process buffer between an input pipe and its reader.
const PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes an output pipe queues before producer writes wait for the reader.
const OUTPUT_QUEUE_LIMIT: usize = 256 * 1024;

/// Longest line kept whole in line mode; longer lines are emitted in pieces.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Writer receiving the bytes of an input pipe.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Default)]
struct PipeBuffer {
    queue: VecDeque<Bytes>,
    queued: usize,
    partial: BytesMut,
    drained: u64,
    closed: bool,
    reading: bool,
}

enum Pop {
    Chunk(Bytes),
    Empty,
    Closed,
}

#[derive(Default)]
struct PipeShared {
    buffer: Mutex<PipeBuffer>,
    /// Wakes the reader.
    notify: Notify,
    /// Wakes producers waiting for queue space.
    space: Notify,
}

impl PipeBuffer {
    fn push(&mut self, chunk: Bytes) {
        self.queued += chunk.len();
        self.queue.push_back(chunk);
    }
}

impl PipeShared {
    fn pop(&self) -> Pop {
        let popped = {
            let mut buffer = lock(&self.buffer);
            match buffer.queue.pop_front() {
                Some(chunk) => {
                    buffer.queued -= chunk.len();
                    buffer.drained += chunk.len() as u64;
                    Pop::Chunk(chunk)
                }
                None if buffer.closed => Pop::Closed,
                None => Pop::Empty,
            }
        };

        if matches!(popped, Pop::Chunk(_)) {
            self.space.notify_waiters();
        }
        popped
    }
}

/// Clears the reader flag when a pipe reader goes away.
struct ReaderGuard(Arc<PipeShared>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        lock(&self.0.buffer).reading = false;
    }
}

/// Output pipe. In line mode (stdout, stderr) each chunk is one whole line.
pub struct PipeOutput {
    line_mode: bool,
    shared: Arc<PipeShared>,
}

impl PipeOutput {
    pub(crate) fn new(line_mode: bool) -> Self {
        Self {
            line_mode,
            shared: Arc::default(),
        }
    }

    pub(crate) fn is_line_mode(&self) -> bool {
        self.line_mode
    }

    /// Queues producer bytes, waiting while the reader is behind by more
    /// than [`OUTPUT_QUEUE_LIMIT`] bytes.
    pub(crate) async fn write(&self, data: Bytes) -> Result<()> {
        loop {
            let space = self.shared.space.notified();
            {
                let mut buffer = lock(&self.shared.buffer);
                if buffer.closed {
                    return Err(Error::invalid_state("pipe is closed for writing"));
                }
                if buffer.queued < OUTPUT_QUEUE_LIMIT {
                    if self.line_mode {
                        buffer.partial.extend_from_slice(&data);
                        split_lines(&mut buffer);
                    } else if !data.is_empty() {
                        buffer.push(data);
                    }
                    break;
                }
            }
            space.await;
        }

        self.shared.notify.notify_one();
        Ok(())
    }

    /// Ends the stream, emitting any unterminated last line.
    pub(crate) fn close(&self) {
        {
            let mut buffer = lock(&self.shared.buffer);
            if buffer.closed {
                return;
            }
            if !buffer.partial.is_empty() {
                let rest = buffer.partial.split().freeze();
                buffer.push(rest);
            }
            buffer.closed = true;
        }

        self.shared.notify.notify_one();
        self.shared.space.notify_waiters();
    }

    pub(crate) fn release(&self) {
        self.close();
        let mut buffer = lock(&self.shared.buffer);
        buffer.queue.clear();
        buffer.queued = 0;
    }

    /// Reads the pipe from `offset`, which may not precede the bytes already drained.
    pub(crate) fn read(&self, offset: u64) -> Result<ChunkStream> {
        let mut skip = {
            let mut buffer = lock(&self.shared.buffer);
            if buffer.reading {
                return Err(Error::invalid_state("pipe already has a reader"));
            }
            if offset < buffer.drained {
                return Err(Error::invalid_input(format!(
                    "pipe was drained up to byte {}, cannot read from offset {}",
                    buffer.drained, offset
                )));
            }
            buffer.reading = true;
            offset - buffer.drained
        };

        let shared = Arc::clone(&self.shared);
        let stream = async_stream::stream! {
            let _guard = ReaderGuard(Arc::clone(&shared));
            loop {
                match shared.pop() {
                    Pop::Chunk(chunk) => {
                        let len = chunk.len() as u64;
                        if skip >= len {
                            skip -= len;
                            continue;
                        }
                        let chunk = chunk.slice(skip as usize..);
                        skip = 0;
                        yield Ok(chunk);
                    }
                    Pop::Empty => shared.notify.notified().await,
                    Pop::Closed => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}

/// Moves complete lines, and over-long partial lines, from `partial` to the queue.
fn split_lines(buffer: &mut PipeBuffer) {
    while let Some(pos) = buffer.partial.iter().position(|b| *b == b'\n') {
        let line = buffer.partial.split_to(pos + 1).freeze();
        buffer.push(line);
    }
    while buffer.partial.len() >= MAX_LINE_LENGTH {
        let piece = buffer.partial.split_to(MAX_LINE_LENGTH).freeze();
        buffer.push(piece);
    }
}

/// Input pipe forwarding received bytes to a process.
///
/// Bytes go to an in-process buffer whose reading end is handed out by
/// [`PipeInput::take_reader`], unless a writer is attached instead.
///
/// Closing the pipe aborts a write that waits for a reader which never
/// drains, so closing never blocks on the process.
pub struct PipeInput {
    sink: tokio::sync::Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<DuplexStream>>,
    closing: CancellationToken,
}

impl PipeInput {
    pub(crate) fn new() -> Self {
        let (writer, reader) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        Self {
            sink: tokio::sync::Mutex::new(Some(Box::new(writer))),
            reader: Mutex::new(Some(reader)),
            closing: CancellationToken::new(),
        }
    }

    pub(crate) fn take_reader(&self) -> Option<DuplexStream> {
        lock(&self.reader).take()
    }

    pub(crate) async fn attach_writer(&self, writer: BoxedWriter) {
        *self.sink.lock().await = Some(writer);
        lock(&self.reader).take();
    }

    pub(crate) async fn accept(&self, data: Bytes) -> Result<()> {
        let write = async {
            match self.sink.lock().await.as_mut() {
                Some(writer) => Ok(writer.write_all(&data).await?),
                None => Err(Error::invalid_state("pipe is closed")),
            }
        };

        tokio::select! {
            biased;
            () = self.closing.cancelled() => Err(Error::invalid_state("pipe is closed")),
            written = write => written,
        }
    }

    /// Closes the writer so the process sees end of input.
    pub(crate) async fn finish(&self) -> Result<()> {
        self.closing.cancel();
        let writer = self.sink.lock().await.take();
        if let Some(mut writer) = writer {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::TryStreamExt;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn line_mode_emits_whole_lines() -> anyhow::Result<()> {
        let pipe = PipeOutput::new(true);
        pipe.write(Bytes::from_static(b"first li")).await?;
        pipe.write(Bytes::from_static(b"ne\nsecond line\nthi")).await?;
        pipe.write(Bytes::from_static(b"rd")).await?;
        pipe.close();

        let chunks: Vec<Bytes> = pipe.read(0)?.try_collect().await?;
        assert_eq!(chunks, vec!["first line\n", "second line\n", "third"]);
        Ok(())
    }

    #[tokio::test]
    async fn drained_offsets_are_rejected() -> anyhow::Result<()> {
        let pipe = PipeOutput::new(false);
        pipe.write(Bytes::from_static(b"abcdef")).await?;
        pipe.write(Bytes::from_static(b"ghij")).await?;

        let mut reader = pipe.read(2)?;
        let first = reader.next().await.transpose()?;
        assert_eq!(first, Some(Bytes::from_static(b"cdef")));
        drop(reader);

        assert!(pipe.read(0).is_err());
        pipe.close();
        let rest: Vec<Bytes> = pipe.read(6)?.try_collect().await?;
        assert_eq!(rest, vec!["ghij"]);
        Ok(())
    }

    #[tokio::test]
    async fn reader_waits_for_writer() -> anyhow::Result<()> {
        let pipe = Arc::new(PipeOutput::new(false));
        let reader = pipe.read(0)?;

        let writer = pipe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = writer.write(Bytes::from_static(b"late")).await;
            writer.close();
        });

        let chunks: Vec<Bytes> = reader.try_collect().await?;
        assert_eq!(chunks, vec!["late"]);
        Ok(())
    }

    #[tokio::test]
    async fn input_forwards_to_reader() -> anyhow::Result<()> {
        let pipe = PipeInput::new();
        let mut reader = pipe
            .take_reader()
            .ok_or_else(|| anyhow::anyhow!("reader taken"))?;

        pipe.accept(Bytes::from_static(b"to stdin")).await?;
        pipe.finish().await?;
        assert!(pipe.accept(Bytes::from_static(b"more")).await.is_err());

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await?;
        assert_eq!(received, b"to stdin");
        Ok(())
    }

    #[tokio::test]
    async fn finish_aborts_a_write_nobody_reads() -> anyhow::Result<()> {
        let pipe = Arc::new(PipeInput::new());
        let writing = {
            let pipe = pipe.clone();
            let data = Bytes::from(vec![0u8; 2 * PIPE_BUFFER_SIZE]);
            tokio::spawn(async move { pipe.accept(data).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writing.is_finished());

        tokio::time::timeout(Duration::from_secs(1), pipe.finish()).await??;
        let written = tokio::time::timeout(Duration::from_secs(1), writing).await??;
        assert!(written.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn full_queue_holds_the_producer_back() -> anyhow::Result<()> {
        let pipe = PipeOutput::new(false);
        pipe.write(Bytes::from(vec![b'a'; OUTPUT_QUEUE_LIMIT])).await?;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            pipe.write(Bytes::from_static(b"b")),
        )
        .await;
        assert!(blocked.is_err());

        let mut reader = pipe.read(0)?;
        let first = reader.next().await.transpose()?;
        assert_eq!(first.map(|c| c.len()), Some(OUTPUT_QUEUE_LIMIT));

        tokio::time::timeout(Duration::from_secs(1), pipe.write(Bytes::from_static(b"b"))).await??;
        assert_eq!(reader.next().await.transpose()?, Some(Bytes::from_static(b"b")));
        Ok(())
    }

    #[tokio::test]
    async fn close_wakes_a_waiting_producer() -> anyhow::Result<()> {
        let pipe = Arc::new(PipeOutput::new(false));
        pipe.write(Bytes::from(vec![b'a'; OUTPUT_QUEUE_LIMIT])).await?;

        let writing = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.write(Bytes::from_static(b"b")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pipe.close();

        let written = tokio::time::timeout(Duration::from_secs(1), writing).await??;
        assert!(written.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn long_lines_are_split() -> anyhow::Result<()> {
        let pipe = PipeOutput::new(true);
        pipe.write(Bytes::from(vec![b'a'; MAX_LINE_LENGTH + 10])).await?;
        pipe.write(Bytes::from_static(b"\nnext\n")).await?;
        pipe.close();

        let lengths: Vec<usize> = pipe
            .read(0)?
            .map_ok(|chunk| chunk.len())
            .try_collect()
            .await?;
        assert_eq!(lengths, vec![MAX_LINE_LENGTH, 11, 5]);
        Ok(())
    }
}
