//! Relay session response types.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Summary of one relay session.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    /// Opaque session identifier.
    pub session_id: String,
    /// Label given at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Base of the slot URIs served through this session, for example
    /// `relay://relay.local:8080?session=<id>`.
    pub base_uri: String,
    /// Whether the terminal's control channel is connected.
    pub is_connected: bool,
    /// Commands awaiting a reply.
    pub pending_commands: usize,
    /// Output streams in flight on the data channel.
    pub open_streams: usize,
    /// When the session was created.
    pub created_at: Timestamp,
}
