//! Progress subscription request types.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Filter of a progress subscription.
#[must_use]
#[derive(Debug, Default, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProgressQuery {
    /// Only forward events of this task.
    #[serde(default)]
    #[validate(length(min = 1, max = 256))]
    pub task_id: Option<String>,
}
