//! Progress notifications consumed by the orchestrating agent.

use serde::{Deserialize, Serialize};

use crate::slot::SlotInstance;

/// Progress event emitted by a slot registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SlotProgress {
    /// A slot was registered and is resolvable at its URI.
    #[serde(rename_all = "camelCase")]
    Attached { slot: SlotInstance },
    /// A slot detached from its peer.
    #[serde(rename_all = "camelCase")]
    Detached { slot: SlotInstance },
    /// The last slot of a task namespace is gone.
    #[serde(rename_all = "camelCase")]
    CommunicationCompleted { task_id: String },
    /// The registry has been closed.
    Concluded,
}

impl SlotProgress {
    /// Returns the task this event refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Attached { slot } | Self::Detached { slot } => Some(&slot.task_id),
            Self::CommunicationCompleted { task_id } => Some(task_id),
            Self::Concluded => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() -> Result<(), serde_json::Error> {
        let event = SlotProgress::CommunicationCompleted {
            task_id: "t1".into(),
        };
        let json = serde_json::to_value(&event)?;
        assert_eq!(json["event"], "communication_completed");
        assert_eq!(json["taskId"], "t1");
        assert_eq!(event.task_id(), Some("t1"));

        let concluded = serde_json::to_value(SlotProgress::Concluded)?;
        assert_eq!(concluded["event"], "concluded");
        Ok(())
    }
}
