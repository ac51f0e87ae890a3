//! Relay session request types.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Request to open a relay session for a terminal.
#[must_use]
#[derive(Debug, Default, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Human-readable label of the terminal, for listings and logs.
    #[serde(default)]
    #[validate(length(max = 128))]
    pub label: Option<String>,
}
