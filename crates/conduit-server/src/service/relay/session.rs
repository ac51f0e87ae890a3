//! Relay side of one terminal session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use conduit_core::{
    ChunkStream, CommandResult, DataFrame, Error, OpenOutputSlotRequest, OperationError,
    RelayReply, RelayRequest, Result, SlotCommand, SlotFrame, SlotInstance, SlotProgress, SlotRef,
};
use conduit_slots::chunks_from_frames;
use jiff::Timestamp;
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::lock;

/// Tracing target for relay sessions.
pub const TRACING_TARGET: &str = "conduit_server::relay::session";

/// Progress events buffered per session.
const PROGRESS_BUFFER: usize = 256;

/// Limits applied to a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Time a command waits for its reply.
    pub command_timeout: Duration,
    /// Frames buffered per output stream.
    pub stream_buffer: usize,
    /// Commands buffered on the control channel.
    pub control_buffer: usize,
}

struct RelaySessionInner {
    id: Uuid,
    label: Option<String>,
    created_at: Timestamp,
    limits: SessionLimits,

    control: std::sync::Mutex<Option<mpsc::Sender<RelayRequest>>>,
    data_attached: AtomicBool,
    pending: std::sync::Mutex<HashMap<Uuid, oneshot::Sender<CommandResult>>>,
    streams: std::sync::Mutex<HashMap<Uuid, mpsc::Sender<SlotFrame>>>,
    relayed: AsyncMutex<HashMap<SlotRef, SlotInstance>>,
    progress: broadcast::Sender<SlotProgress>,
    closed: CancellationToken,
}

/// A terminal reachable through this relay.
///
/// Commands go out on the control channel and are matched to replies by
/// command id. Output slots opened on the terminal stream back on the data
/// channel, each under the stream id the relay assigned when opening it.
#[derive(Clone)]
pub struct RelaySession {
    inner: Arc<RelaySessionInner>,
}

impl RelaySession {
    /// Creates a session with no terminal attached.
    pub fn new(label: Option<String>, limits: SessionLimits) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_BUFFER);
        let inner = RelaySessionInner {
            id: Uuid::now_v7(),
            label,
            created_at: Timestamp::now(),
            limits,
            control: std::sync::Mutex::new(None),
            data_attached: AtomicBool::new(false),
            pending: std::sync::Mutex::new(HashMap::new()),
            streams: std::sync::Mutex::new(HashMap::new()),
            relayed: AsyncMutex::new(HashMap::new()),
            progress,
            closed: CancellationToken::new(),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the session id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Returns the terminal's label.
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Returns when the session was opened.
    pub fn created_at(&self) -> Timestamp {
        self.inner.created_at
    }

    /// Returns `true` while a terminal holds the control channel.
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.control)
            .as_ref()
            .is_some_and(|control| !control.is_closed())
    }

    /// Returns the number of commands awaiting a reply.
    pub fn pending_commands(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Returns the number of output streams in flight.
    pub fn open_streams(&self) -> usize {
        lock(&self.inner.streams).len()
    }

    /// Returns a token cancelled when the session is closed.
    pub fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Returns a receiver of the terminal's progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<SlotProgress> {
        self.inner.progress.subscribe()
    }

    /// Sends `command` to the terminal and waits for its reply.
    ///
    /// Fails with a timeout if no reply arrives in time, and with a
    /// transient error if no terminal is attached or it detaches first.
    pub async fn command(&self, command: SlotCommand) -> Result<CommandResult> {
        let command_id = Uuid::new_v4();
        let name = command.name();

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.inner.pending).insert(command_id, reply_tx);
        let _pending = PendingCommand {
            session: &self.inner,
            command_id,
        };

        let control = lock(&self.inner.control).clone().ok_or_else(|| {
            Error::transient(format!("terminal of relay session '{}' is not attached", self.id()))
        })?;

        tracing::debug!(
            target: TRACING_TARGET,
            session_id = %self.id(),
            command_id = %command_id,
            command = name,
            "Relaying command"
        );

        let exchange = async {
            control
                .send(RelayRequest::Command {
                    command_id,
                    command,
                })
                .await
                .map_err(|_| {
                    Error::transient(format!("terminal of relay session '{}' detached", self.id()))
                })?;

            let result = reply_rx.await.map_err(|_| {
                Error::transient(format!(
                    "relay session '{}' dropped command '{name}'",
                    self.id()
                ))
            })?;
            Ok::<_, Error>(result)
        };

        let timeout = self.inner.limits.command_timeout;
        let result = tokio::time::timeout(timeout, exchange).await.map_err(|_| {
            tracing::warn!(
                target: TRACING_TARGET,
                session_id = %self.id(),
                command_id = %command_id,
                command = name,
                "Relayed command timed out"
            );
            Error::timeout(format!(
                "command '{name}' to relay session '{}' timed out after {}ms",
                self.id(),
                timeout.as_millis()
            ))
        })??;

        result.into_result()
    }

    /// Opens an output slot on the terminal and streams it back.
    ///
    /// The stream is registered before the command is sent, so frames that
    /// race ahead of the reply are not lost.
    pub async fn open(&self, request: OpenOutputSlotRequest) -> Result<ChunkStream> {
        let stream_id = Uuid::new_v4();
        let (frames_tx, mut frames_rx) = mpsc::channel(self.inner.limits.stream_buffer.max(1));
        lock(&self.inner.streams).insert(stream_id, frames_tx);
        let registration = OpenStream {
            session: Arc::clone(&self.inner),
            stream_id,
        };

        let source = format!("relay session {} slot {}", self.id(), request.slot.slot_name);
        self.command(SlotCommand::Open { stream_id, request }).await?;

        let frames = async_stream::stream! {
            let _registration = registration;
            while let Some(frame) = frames_rx.recv().await {
                yield Ok(frame);
            }
        };

        Ok(chunks_from_frames(frames, source))
    }

    /// Attaches the terminal's control channel and returns the commands to send it.
    pub fn attach_control(&self) -> Result<mpsc::Receiver<RelayRequest>> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::not_found(format!("relay session '{}' is closed", self.id())));
        }

        let mut control = lock(&self.inner.control);
        if control.as_ref().is_some_and(|sender| !sender.is_closed()) {
            return Err(Error::already_exists(format!(
                "relay session '{}' already has a control channel",
                self.id()
            )));
        }

        let (sender, receiver) = mpsc::channel(self.inner.limits.control_buffer.max(1));
        *control = Some(sender);

        tracing::info!(target: TRACING_TARGET, session_id = %self.id(), "Control channel attached");
        Ok(receiver)
    }

    /// Detaches the control channel and fails every command awaiting a reply.
    pub fn detach_control(&self) {
        lock(&self.inner.control).take();

        let pending: Vec<_> = lock(&self.inner.pending).drain().collect();
        let error = Error::transient(format!("terminal of relay session '{}' detached", self.id()));
        for (_, reply) in pending {
            let _ = reply.send(CommandResult::Failed(OperationError::from(&error)));
        }

        tracing::info!(target: TRACING_TARGET, session_id = %self.id(), "Control channel detached");
    }

    /// Marks the data channel attached.
    pub fn attach_data(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::not_found(format!("relay session '{}' is closed", self.id())));
        }

        self.inner
            .data_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                Error::already_exists(format!(
                    "relay session '{}' already has a data channel",
                    self.id()
                ))
            })?;

        tracing::info!(target: TRACING_TARGET, session_id = %self.id(), "Data channel attached");
        Ok(())
    }

    /// Detaches the data channel. Streams in flight end truncated.
    pub fn detach_data(&self) {
        self.inner.data_attached.store(false, Ordering::Release);
        let dropped = {
            let mut streams = lock(&self.inner.streams);
            let dropped = streams.len();
            streams.clear();
            dropped
        };

        tracing::info!(
            target: TRACING_TARGET,
            session_id = %self.id(),
            dropped_streams = dropped,
            "Data channel detached"
        );
    }

    /// Routes a control message from the terminal.
    pub fn handle_reply(&self, reply: RelayReply) {
        match reply {
            RelayReply::Reply { command_id, result } => {
                let waiting = lock(&self.inner.pending).remove(&command_id);
                match waiting {
                    Some(waiting) => {
                        let _ = waiting.send(result);
                    }
                    None => tracing::debug!(
                        target: TRACING_TARGET,
                        session_id = %self.id(),
                        command_id = %command_id,
                        "Reply to an unknown or expired command dropped"
                    ),
                }
            }
            RelayReply::Progress(event) => {
                let _ = self.inner.progress.send(event);
            }
        }
    }

    /// Routes a data frame from the terminal to the stream it belongs to.
    ///
    /// Waits while the stream's reader is behind.
    pub async fn handle_data(&self, frame: DataFrame) {
        let DataFrame {
            stream_id,
            slot,
            frame,
        } = frame;

        let last = matches!(frame, SlotFrame::Eos | SlotFrame::Error(_));
        let sender = {
            let mut streams = lock(&self.inner.streams);
            if last {
                streams.remove(&stream_id)
            } else {
                streams.get(&stream_id).cloned()
            }
        };

        let Some(sender) = sender else {
            tracing::debug!(
                target: TRACING_TARGET,
                session_id = %self.id(),
                stream_id = %stream_id,
                slot = %slot,
                "Frame of an unknown stream dropped"
            );
            return;
        };

        if sender.send(frame).await.is_err() {
            lock(&self.inner.streams).remove(&stream_id);
            tracing::debug!(
                target: TRACING_TARGET,
                session_id = %self.id(),
                stream_id = %stream_id,
                slot = %slot,
                "Reader went away, stream dropped"
            );
        }
    }

    /// Remembers the relay-addressed instance of a relayed slot.
    pub async fn remember(&self, instance: SlotInstance) {
        self.inner
            .relayed
            .lock()
            .await
            .insert(SlotRef::from(&instance), instance);
    }

    /// Forgets a relayed slot, returning its instance.
    pub async fn forget(&self, slot: &SlotRef) -> Option<SlotInstance> {
        self.inner.relayed.lock().await.remove(slot)
    }

    /// Closes the session, returning the relayed slots still remembered.
    pub async fn close(&self) -> Vec<SlotInstance> {
        self.inner.closed.cancel();
        self.detach_control();
        self.detach_data();

        let relayed: Vec<_> = self.inner.relayed.lock().await.drain().map(|(_, v)| v).collect();
        tracing::info!(
            target: TRACING_TARGET,
            session_id = %self.id(),
            relayed_slots = relayed.len(),
            "Relay session closed"
        );
        relayed
    }
}

impl std::fmt::Debug for RelaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySession")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_commands())
            .field("streams", &self.open_streams())
            .finish_non_exhaustive()
    }
}

/// Removes a command from the pending table once its caller stops waiting.
struct PendingCommand<'a> {
    session: &'a RelaySessionInner,
    command_id: Uuid,
}

impl Drop for PendingCommand<'_> {
    fn drop(&mut self) {
        lock(&self.session.pending).remove(&self.command_id);
    }
}

/// Removes an output stream once its reader is dropped.
struct OpenStream {
    session: Arc<RelaySessionInner>,
    stream_id: Uuid,
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        lock(&self.session.streams).remove(&self.stream_id);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use conduit_core::{ErrorKind, SlotDirection, SlotMedia, SlotSpec, SlotState, SlotStatus};
    use futures::TryStreamExt;

    use super::*;

    fn limits() -> SessionLimits {
        SessionLimits {
            command_timeout: Duration::from_secs(10),
            stream_buffer: 8,
            control_buffer: 8,
        }
    }

    fn status() -> SlotStatus {
        SlotStatus {
            task_id: "t1".into(),
            name: "/out".into(),
            direction: SlotDirection::Output,
            media: SlotMedia::File,
            state: SlotState::Unbound,
            channel_id: String::new(),
            peer_uri: None,
            bytes: 0,
            error: None,
        }
    }

    /// Answers every command with `answer` until the control channel closes.
    fn answer_with(
        session: &RelaySession,
        mut commands: mpsc::Receiver<RelayRequest>,
        answer: impl Fn(&SlotCommand) -> CommandResult + Send + 'static,
    ) -> tokio::task::JoinHandle<Vec<SlotCommand>> {
        let session = session.clone();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(RelayRequest::Command { command_id, command }) = commands.recv().await {
                let result = answer(&command);
                seen.push(command);
                session.handle_reply(RelayReply::Reply { command_id, result });
            }
            seen
        })
    }

    #[tokio::test]
    async fn replies_are_matched_by_command_id() -> anyhow::Result<()> {
        let session = RelaySession::new(Some("edge".into()), limits());
        let commands = session.attach_control()?;
        let terminal = answer_with(&session, commands, |_| CommandResult::Status(status()));

        let result = session.command(SlotCommand::Status(SlotRef::new("t1", "/out"))).await?;
        assert!(matches!(result, CommandResult::Status(s) if s.name == "/out"));
        assert_eq!(session.pending_commands(), 0);

        session.detach_control();
        let seen = terminal.await?;
        assert_eq!(seen.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_returned_as_errors() -> anyhow::Result<()> {
        let session = RelaySession::new(None, limits());
        let commands = session.attach_control()?;
        let _terminal = answer_with(&session, commands, |_| {
            CommandResult::Failed(OperationError::from(&Error::not_found("slot '/out' not found")))
        });

        let error = session
            .command(SlotCommand::Status(SlotRef::new("t1", "/out")))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_terminal_times_out() -> anyhow::Result<()> {
        let session = RelaySession::new(None, limits());
        let _commands = session.attach_control()?;

        let error = session
            .command(SlotCommand::Status(SlotRef::new("t1", "/out")))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Timeout);
        assert_eq!(session.pending_commands(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn missing_or_detached_terminal_is_transient() -> anyhow::Result<()> {
        let session = RelaySession::new(None, limits());
        let error = session
            .command(SlotCommand::Status(SlotRef::new("t1", "/out")))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Transient);

        let mut commands = session.attach_control()?;
        let waiting = {
            let session = session.clone();
            tokio::spawn(async move {
                session.command(SlotCommand::Status(SlotRef::new("t1", "/out"))).await
            })
        };
        assert!(commands.recv().await.is_some());
        session.detach_control();

        let error = waiting.await?.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Transient);
        Ok(())
    }

    #[tokio::test]
    async fn second_control_channel_is_rejected() -> anyhow::Result<()> {
        let session = RelaySession::new(None, limits());
        let _commands = session.attach_control()?;
        assert_eq!(session.attach_control().unwrap_err().kind(), ErrorKind::AlreadyExists);

        session.attach_data()?;
        assert_eq!(session.attach_data().unwrap_err().kind(), ErrorKind::AlreadyExists);
        Ok(())
    }

    #[tokio::test]
    async fn opened_streams_end_at_eos() -> anyhow::Result<()> {
        let session = RelaySession::new(None, limits());
        let mut commands = session.attach_control()?;

        let terminal = {
            let session = session.clone();
            tokio::spawn(async move {
                let Some(RelayRequest::Command { command_id, command }) = commands.recv().await
                else {
                    return;
                };
                let SlotCommand::Open { stream_id, request } = command else {
                    return;
                };

                let slot = request.slot.slot_name;
                session
                    .handle_data(DataFrame::new(
                        stream_id,
                        slot.clone(),
                        SlotFrame::Chunk(Bytes::from_static(b"hello\n")),
                    ))
                    .await;
                session.handle_reply(RelayReply::Reply {
                    command_id,
                    result: CommandResult::Accepted,
                });
                session
                    .handle_data(DataFrame::new(stream_id, slot, SlotFrame::Eos))
                    .await;
            })
        };

        let chunks = session
            .open(OpenOutputSlotRequest {
                slot: SlotRef::new("t1", "/out"),
                offset: 0,
            })
            .await?;
        let chunks: Vec<Bytes> = chunks.try_collect().await?;
        assert_eq!(chunks, vec![Bytes::from_static(b"hello\n")]);

        terminal.await?;
        assert_eq!(session.open_streams(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn closing_returns_relayed_slots() -> anyhow::Result<()> {
        let session = RelaySession::new(None, limits());
        let instance = SlotInstance {
            spec: SlotSpec::new("/in", SlotMedia::File, SlotDirection::Input),
            task_id: "t2".into(),
            channel_id: "c1".into(),
            uri: conduit_core::SlotUri::parse("relay://relay:8080/t2/in?session=s")?,
        };
        session.remember(instance.clone()).await;

        let token = session.closed();
        assert_eq!(session.close().await, vec![instance]);
        assert!(token.is_cancelled());
        assert_eq!(session.attach_control().unwrap_err().kind(), ErrorKind::NotFound);
        Ok(())
    }
}
