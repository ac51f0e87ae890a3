//! Messages exchanged between a relay and its terminal sessions.
//!
//! The control channel carries JSON [`RelayRequest`] and [`RelayReply`]
//! messages correlated by command id. The data channel carries binary
//! [`DataFrame`]s tagged by stream id and slot name, so slow transfers never
//! delay control traffic.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::{SlotFrame, SlotFrameCodec};
use crate::operation::{Operation, OperationError};
use crate::progress::SlotProgress;
use crate::request::{ConnectSlotRequest, CreateSlotRequest, OpenOutputSlotRequest, SlotRef};
use crate::slot::SlotStatus;

/// A slot command forwarded to a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum SlotCommand {
    /// `createSlot`.
    Create(CreateSlotRequest),
    /// `connectSlot`.
    Connect(ConnectSlotRequest),
    /// `disconnectSlot`.
    Disconnect(SlotRef),
    /// `statusSlot`.
    Status(SlotRef),
    /// `destroySlot`.
    Destroy(SlotRef),
    /// `openOutputSlot`, streamed back over the data channel as `stream_id`.
    #[serde(rename_all = "camelCase")]
    Open {
        stream_id: Uuid,
        request: OpenOutputSlotRequest,
    },
}

impl SlotCommand {
    /// Returns the command name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Connect(_) => "connect",
            Self::Disconnect(_) => "disconnect",
            Self::Status(_) => "status",
            Self::Destroy(_) => "destroy",
            Self::Open { .. } => "open",
        }
    }
}

/// Result of a slot command executed by a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "value", rename_all = "snake_case")]
pub enum CommandResult {
    /// Command finished and reports the slot status.
    Status(SlotStatus),
    /// Command was handed to a long-running operation.
    Operation(Operation),
    /// Command was accepted without a payload.
    Accepted,
    /// Command failed.
    Failed(OperationError),
}

impl CommandResult {
    /// Converts a failure into an error, passing other results through.
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Failed(error) => Err(Error::from(error)),
            other => Ok(other),
        }
    }
}

/// Relay to terminal control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RelayRequest {
    /// Execute a slot command.
    #[serde(rename_all = "camelCase")]
    Command {
        command_id: Uuid,
        command: SlotCommand,
    },
}

/// Terminal to relay control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RelayReply {
    /// Reply to a command with the same id.
    #[serde(rename_all = "camelCase")]
    Reply {
        command_id: Uuid,
        result: CommandResult,
    },
    /// Progress event of the terminal's registry.
    Progress(SlotProgress),
}

/// One multiplexed frame on a session's data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Stream the frame belongs to, as assigned by the `Open` command.
    pub stream_id: Uuid,
    /// Name of the slot being streamed.
    pub slot: String,
    /// Payload.
    pub frame: SlotFrame,
}

impl DataFrame {
    /// Creates a new data frame.
    pub fn new(stream_id: Uuid, slot: impl Into<String>, frame: SlotFrame) -> Self {
        Self {
            stream_id,
            slot: slot.into(),
            frame,
        }
    }

    /// Encodes the frame as `stream id | slot length | slot | slot frame`.
    pub fn encode(&self) -> Bytes {
        let slot = self.slot.as_bytes();
        let mut dst = BytesMut::with_capacity(16 + 2 + slot.len());
        dst.put_slice(self.stream_id.as_bytes());
        dst.put_u16(slot.len() as u16);
        dst.put_slice(slot);
        self.frame.encode_into(&mut dst);
        dst.freeze()
    }

    /// Decodes a frame produced by [`DataFrame::encode`].
    pub fn decode(mut src: Bytes) -> Result<Self> {
        if src.len() < 18 {
            return Err(Error::invalid_input("data frame shorter than its header"));
        }

        let mut id = [0u8; 16];
        src.copy_to_slice(&mut id);
        let slot_len = src.get_u16() as usize;
        if src.len() < slot_len {
            return Err(Error::invalid_input("data frame slot name is truncated"));
        }
        let slot = String::from_utf8(src.split_to(slot_len).to_vec())
            .map_err(|e| Error::invalid_input("data frame slot name is not utf-8").with_source(e))?;

        let mut rest = BytesMut::from(&src[..]);
        let frame = SlotFrameCodec::new()
            .decode(&mut rest)?
            .ok_or_else(|| Error::invalid_input("data frame payload is truncated"))?;

        Ok(Self {
            stream_id: Uuid::from_bytes(id),
            slot,
            frame,
        })
    }
}
