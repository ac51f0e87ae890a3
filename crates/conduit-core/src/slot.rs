//! Slot model: specs, states, instances and status summaries.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, IntoStaticStr};

use crate::uri::SlotUri;

/// Name scheme selecting the local output file variant.
pub const LOCAL_SCHEME: &str = "local";

/// Name scheme selecting snapshot-backed slots.
pub const SNAPSHOT_SCHEME: &str = "snapshot";

/// Binding prefix of plain channels.
pub const CHANNEL_BINDING_PREFIX: &str = "channel:";

/// Binding prefix of snapshot channels.
pub const SNAPSHOT_BINDING_PREFIX: &str = "snapshot:";

/// Direction of a slot relative to the task owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, IntoStaticStr, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SlotDirection {
    /// The task reads from this slot.
    Input,
    /// The task writes to this slot.
    Output,
}

/// Media kind of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, IntoStaticStr, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SlotMedia {
    /// A regular file.
    File,
    /// A pipe such as stdin, stdout or stderr.
    Pipe,
    /// A literal command-line argument.
    Arg,
}

/// Lifecycle state of a slot.
///
/// States are ordered: a slot only ever moves forward, and `Destroyed` is the
/// single terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(AsRefStr, IntoStaticStr, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Created but not yet bound to any data.
    Unbound,
    /// The producer started writing.
    Preparing,
    /// Data is available or flowing.
    Open,
    /// Detached from its peer; no further data flows.
    Suspended,
    /// Terminal state.
    Destroyed,
}

impl SlotState {
    /// Returns `true` for the terminal state.
    pub fn is_terminal(self) -> bool {
        self == Self::Destroyed
    }

    /// Returns `true` once the slot no longer moves data.
    pub fn is_closed(self) -> bool {
        self >= Self::Suspended
    }
}

/// Declaration of a slot as made by a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSpec {
    /// Slot name, unique within the task namespace.
    pub name: String,
    /// Media kind.
    pub media: SlotMedia,
    /// Direction.
    pub direction: SlotDirection,
    /// Opaque schema tag.
    #[serde(default)]
    pub content_type: String,
}

impl SlotSpec {
    /// Creates a new slot spec with an empty content type.
    pub fn new(name: impl Into<String>, media: SlotMedia, direction: SlotDirection) -> Self {
        Self {
            name: name.into(),
            media,
            direction,
            content_type: String::new(),
        }
    }

    /// Sets the content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Returns the scheme of the slot name, if it has one (`local://out` is `local`).
    pub fn name_scheme(&self) -> Option<&str> {
        self.name.split_once("://").map(|(scheme, _)| scheme)
    }

    /// Returns the name without its scheme prefix.
    pub fn name_path(&self) -> &str {
        self.name
            .split_once("://")
            .map_or(self.name.as_str(), |(_, path)| path)
    }

    /// Returns `true` for local output files excluded from cross-host resolution.
    pub fn is_local(&self) -> bool {
        self.direction == SlotDirection::Output && self.name_scheme() == Some(LOCAL_SCHEME)
    }

    /// Returns `true` for input slots.
    pub fn is_input(&self) -> bool {
        self.direction == SlotDirection::Input
    }

    /// Returns `true` for output slots.
    pub fn is_output(&self) -> bool {
        self.direction == SlotDirection::Output
    }
}

/// Strips a `channel:` prefix from a binding string.
pub fn normalize_binding(binding: &str) -> &str {
    binding
        .strip_prefix(CHANNEL_BINDING_PREFIX)
        .unwrap_or(binding)
}

/// Returns the snapshot id of a `snapshot:<id>` binding.
pub fn snapshot_binding(binding: &str) -> Option<&str> {
    binding
        .strip_prefix(SNAPSHOT_BINDING_PREFIX)
        .filter(|id| !id.is_empty())
}

/// A slot together with its owning task, channel binding and resolvable URI.
///
/// This is the single wire representation of a slot across peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotInstance {
    /// Slot declaration.
    pub spec: SlotSpec,
    /// Owning task.
    pub task_id: String,
    /// Channel binding with any `channel:` prefix stripped.
    pub channel_id: String,
    /// Externally resolvable URI.
    pub uri: SlotUri,
}

impl SlotInstance {
    /// Returns the slot name.
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Status summary of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    /// Owning task.
    pub task_id: String,
    /// Slot name.
    pub name: String,
    /// Direction.
    pub direction: SlotDirection,
    /// Media kind.
    pub media: SlotMedia,
    /// Current state.
    pub state: SlotState,
    /// Channel binding.
    pub channel_id: String,
    /// URI of the connected peer, for input slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_uri: Option<SlotUri>,
    /// Bytes written to or read from the backend so far.
    #[serde(default)]
    pub bytes: u64,
    /// Failure attached to a destroyed slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
