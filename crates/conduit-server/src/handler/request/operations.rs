//! Operation request types.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Long-poll parameters of an operation lookup.
#[must_use]
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, Validate)]
#[serde(rename_all = "snake_case")]
pub struct WaitQuery {
    /// Milliseconds to wait for the operation to finish before answering.
    #[serde(default)]
    #[validate(range(max = 60000))]
    pub wait_ms: u64,
}
