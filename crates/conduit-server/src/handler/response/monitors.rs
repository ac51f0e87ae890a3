//! Monitor response types.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

/// Node health and load summary.
#[must_use]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Whether the node accepts new slots.
    pub is_healthy: bool,
    /// Number of registered slots.
    pub slots: usize,
    /// Number of open relay sessions.
    pub sessions: usize,
    /// Base URI this node advertises its slots under.
    pub base_uri: String,
    /// When the node started serving.
    pub started_at: Timestamp,
    /// When this status was generated.
    pub updated_at: Timestamp,
}
