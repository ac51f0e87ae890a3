//! Request and response payloads of the data-plane RPC surface.

use serde::{Deserialize, Serialize};

use crate::slot::{SlotInstance, SlotSpec};
use crate::uri::SlotUri;

/// Address of a slot within a peer: `(taskId, slotName)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotRef {
    /// Owning task.
    pub task_id: String,
    /// Slot name.
    pub slot_name: String,
}

impl SlotRef {
    /// Creates a new slot reference.
    pub fn new(task_id: impl Into<String>, slot_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            slot_name: slot_name.into(),
        }
    }
}

impl From<&SlotUri> for SlotRef {
    fn from(uri: &SlotUri) -> Self {
        Self::new(uri.task_id(), uri.slot_name())
    }
}

impl From<&SlotInstance> for SlotRef {
    fn from(instance: &SlotInstance) -> Self {
        Self::new(instance.task_id.clone(), instance.spec.name.clone())
    }
}

/// `createSlot(taskId, slotSpec, channelId)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSlotRequest {
    /// Owning task.
    pub task_id: String,
    /// Slot declaration.
    pub slot: SlotSpec,
    /// Channel binding, optionally prefixed with `channel:` or `snapshot:`.
    #[serde(default)]
    pub channel_id: String,
}

/// `connectSlot(fromSlotRef, toSlotRef)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectSlotRequest {
    /// Local input slot.
    pub from: SlotRef,
    /// Producer slot to read from.
    pub to: SlotInstance,
    /// Starting byte offset.
    #[serde(default)]
    pub offset: u64,
}

/// `openOutputSlot(slotRef, offset)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOutputSlotRequest {
    /// Output slot to read.
    pub slot: SlotRef,
    /// Starting byte offset.
    #[serde(default)]
    pub offset: u64,
}

/// Response listing slot statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatusList {
    /// All known slots.
    pub slots: Vec<crate::slot::SlotStatus>,
}
