//! Terminal side of a relay session.
//!
//! A terminal that cannot be reached directly keeps two channels open to a
//! relay: commands arrive on the control channel and are answered there by
//! command id, while output slots opened by the relay stream back on the data
//! channel.

use std::sync::Arc;

use conduit_core::{
    CommandResult, DataFrame, Error, OperationError, RelayReply, RelayRequest, Result,
    SlotCommand,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::frames::frames_from_chunks;
use crate::service::SlotService;

/// Tracing target for the relay agent.
pub const TRACING_TARGET: &str = "conduit_slots::relay";

/// Frames buffered between output streams and the data channel.
const DATA_BUFFER: usize = 64;

/// Executes relayed slot commands against a local [`SlotService`].
#[derive(Debug, Clone)]
pub struct RelayAgent {
    service: Arc<SlotService>,
    streams: TaskTracker,
}

impl RelayAgent {
    /// Creates an agent for `service`.
    pub fn new(service: Arc<SlotService>) -> Self {
        Self {
            service,
            streams: TaskTracker::new(),
        }
    }

    /// Executes one command. Output streams opened by the command are sent to `data`.
    pub async fn execute(
        &self,
        command: SlotCommand,
        data: &mpsc::Sender<DataFrame>,
    ) -> CommandResult {
        let name = command.name();
        match self.try_execute(command, data).await {
            Ok(result) => result,
            Err(error) => {
                tracing::debug!(
                    target: TRACING_TARGET,
                    command = name,
                    error = %error,
                    "Relayed command failed"
                );
                CommandResult::Failed(OperationError::from(&error))
            }
        }
    }

    async fn try_execute(
        &self,
        command: SlotCommand,
        data: &mpsc::Sender<DataFrame>,
    ) -> Result<CommandResult> {
        let service = &self.service;
        match command {
            SlotCommand::Create(request) => {
                Ok(CommandResult::Status(service.create_slot(request).await?))
            }
            SlotCommand::Connect(request) => {
                Ok(CommandResult::Operation(service.connect_slot(request, None)?))
            }
            SlotCommand::Disconnect(slot) => {
                Ok(CommandResult::Status(service.disconnect_slot(&slot).await?))
            }
            SlotCommand::Status(slot) => Ok(CommandResult::Status(service.status_slot(&slot)?)),
            SlotCommand::Destroy(slot) => {
                Ok(CommandResult::Operation(service.destroy_slot(&slot, None)?))
            }
            SlotCommand::Open { stream_id, request } => {
                let chunks = service.open_output_slot(&request)?;
                self.stream(stream_id, request.slot.slot_name, chunks, data.clone());
                Ok(CommandResult::Accepted)
            }
        }
    }

    fn stream(
        &self,
        stream_id: Uuid,
        slot: String,
        chunks: conduit_core::ChunkStream,
        data: mpsc::Sender<DataFrame>,
    ) {
        self.streams.spawn(async move {
            let mut frames = std::pin::pin!(frames_from_chunks(chunks));
            while let Some(frame) = frames.next().await {
                if data.send(DataFrame::new(stream_id, slot.clone(), frame)).await.is_err() {
                    tracing::debug!(
                        target: TRACING_TARGET,
                        stream_id = %stream_id,
                        slot = %slot,
                        "Data channel closed, dropping output stream"
                    );
                    return;
                }
            }
        });
    }

    /// Serves a relay session until the control channel ends.
    ///
    /// Progress events of the local registry are forwarded on the control channel.
    pub async fn run<C, R, D>(&self, commands: C, replies: R, data: D) -> Result<()>
    where
        C: Stream<Item = Result<RelayRequest>> + Send,
        R: Sink<RelayReply, Error = Error> + Send,
        D: Sink<DataFrame, Error = Error> + Send + 'static,
    {
        let mut commands = std::pin::pin!(commands);
        let mut replies = std::pin::pin!(replies);
        let mut progress = self.service.subscribe();

        let (data_tx, mut data_rx) = mpsc::channel::<DataFrame>(DATA_BUFFER);
        let forwarder = tokio::spawn(async move {
            let mut data = std::pin::pin!(data);
            while let Some(frame) = data_rx.recv().await {
                if let Err(error) = data.send(frame).await {
                    tracing::warn!(target: TRACING_TARGET, error = %error, "Data channel failed");
                    return;
                }
            }
            let _ = data.close().await;
        });

        tracing::info!(target: TRACING_TARGET, "Relay session started");

        let outcome = loop {
            tokio::select! {
                request = commands.next() => {
                    let Some(request) = request else { break Ok(()) };
                    let RelayRequest::Command { command_id, command } = match request {
                        Ok(request) => request,
                        Err(error) => break Err(error),
                    };

                    tracing::debug!(
                        target: TRACING_TARGET,
                        command_id = %command_id,
                        command = command.name(),
                        "Relayed command received"
                    );
                    let result = self.execute(command, &data_tx).await;
                    let reply = RelayReply::Reply { command_id, result };
                    if let Err(error) = replies.send(reply).await {
                        break Err(error);
                    }
                }
                event = progress.recv() => match event {
                    Ok(event) => {
                        if let Err(error) = replies.send(RelayReply::Progress(event)).await {
                            break Err(error);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: TRACING_TARGET,
                            skipped = skipped,
                            "Progress events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break Ok(()),
                },
            }
        };

        drop(data_tx);
        self.streams.close();
        self.streams.wait().await;
        if forwarder.await.is_err() {
            tracing::error!(target: TRACING_TARGET, "Data channel forwarder panicked");
        }

        tracing::info!(target: TRACING_TARGET, "Relay session ended");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use conduit_core::{
        CreateSlotRequest, OpenOutputSlotRequest, SlotDirection, SlotFrame, SlotMedia, SlotRef,
        SlotSpec, SlotState,
    };
    use futures::channel::mpsc as futures_mpsc;

    use super::*;
    use crate::config::SlotsConfig;

    fn service(dir: &std::path::Path) -> anyhow::Result<Arc<SlotService>> {
        Ok(SlotService::builder(SlotsConfig::new("fs://127.0.0.1:9000", dir)).build()?)
    }

    #[tokio::test]
    async fn commands_are_answered_by_id_and_streams_end_with_eos() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let service = service(dir.path())?;
        let agent = RelayAgent::new(service.clone());

        let (command_tx, command_rx) = futures_mpsc::unbounded::<Result<RelayRequest>>();
        let (reply_tx, mut reply_rx) = futures_mpsc::unbounded::<RelayReply>();
        let (data_tx, mut data_rx) = futures_mpsc::unbounded::<DataFrame>();

        let running = {
            let agent = agent.clone();
            let replies = reply_tx.sink_map_err(|e| Error::transient(e.to_string()));
            let data = data_tx.sink_map_err(|e| Error::transient(e.to_string()));
            tokio::spawn(async move { agent.run(command_rx, replies, data).await })
        };

        let create_id = Uuid::new_v4();
        command_tx.unbounded_send(Ok(RelayRequest::Command {
            command_id: create_id,
            command: SlotCommand::Create(CreateSlotRequest {
                task_id: "t1".into(),
                slot: SlotSpec::new("/out", SlotMedia::File, SlotDirection::Output),
                channel_id: String::new(),
            }),
        }))
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let mut answered = None;
        while let Some(reply) = reply_rx.next().await {
            if let RelayReply::Reply { command_id, result } = reply {
                answered = Some((command_id, result));
                break;
            }
        }
        let (command_id, result) = answered.ok_or_else(|| anyhow::anyhow!("no reply"))?;
        assert_eq!(command_id, create_id);
        assert!(matches!(
            result,
            CommandResult::Status(status) if status.state == SlotState::Unbound
        ));

        let slot = service.registry().get("t1", "/out")?;
        slot.write(Bytes::from_static(b"hello\n")).await?;
        slot.close_writer().await?;

        let stream_id = Uuid::new_v4();
        command_tx.unbounded_send(Ok(RelayRequest::Command {
            command_id: Uuid::new_v4(),
            command: SlotCommand::Open {
                stream_id,
                request: OpenOutputSlotRequest {
                    slot: SlotRef::new("t1", "/out"),
                    offset: 0,
                },
            },
        }))
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let mut payload = Vec::new();
        while let Some(frame) = data_rx.next().await {
            assert_eq!(frame.stream_id, stream_id);
            assert_eq!(frame.slot, "/out");
            match frame.frame {
                SlotFrame::Chunk(chunk) => payload.extend_from_slice(&chunk),
                SlotFrame::Eos => break,
                SlotFrame::Error(message) => anyhow::bail!(message),
            }
        }
        assert_eq!(payload, b"hello\n");

        drop(command_tx);
        running.await??;
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let agent = RelayAgent::new(service(dir.path())?);
        let (data, _frames) = mpsc::channel(1);

        let result = agent
            .execute(SlotCommand::Status(SlotRef::new("t1", "/missing")), &data)
            .await;
        let CommandResult::Failed(error) = &result else {
            anyhow::bail!("expected a failure, got {result:?}");
        };
        assert_eq!(error.kind, conduit_core::ErrorKind::NotFound);
        Ok(())
    }
}
