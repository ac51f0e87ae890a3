//! Path parameter types for HTTP handlers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Path parameters for operation lookups.
#[must_use]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPathParams {
    /// Identifier of the long-running operation.
    pub operation_id: Uuid,
}

/// Path parameters for channel operations.
#[must_use]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPathParams {
    /// Identifier of the channel.
    pub channel_id: String,
}

/// Path parameters for snapshot operations.
#[must_use]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPathParams {
    /// Identifier of the snapshot.
    pub snapshot_id: String,
}

/// Path parameters for relay session operations.
#[must_use]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPathParams {
    /// Identifier of the relay session.
    pub session_id: Uuid,
}
