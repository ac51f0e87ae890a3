//! Long-running operation model.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind};

/// Failure recorded on a finished operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl From<&Error> for OperationError {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.message_or_kind().to_string(),
        }
    }
}

impl From<OperationError> for Error {
    fn from(error: OperationError) -> Self {
        Error::new(error.kind).with_message(error.message)
    }
}

/// An asynchronously completed unit of work, polled by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation id.
    pub id: Uuid,
    /// What the operation does.
    pub description: String,
    /// Idempotency key the operation was created with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time.
    pub modified_at: Timestamp,
    /// Whether the operation finished.
    pub done: bool,
    /// Result of a successful operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Failure of an unsuccessful operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl Operation {
    /// Creates a pending operation.
    pub fn new(description: impl Into<String>, idempotency_key: Option<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id: Uuid::now_v7(),
            description: description.into(),
            idempotency_key,
            created_at: now,
            modified_at: now,
            done: false,
            response: None,
            error: None,
        }
    }

    /// Marks the operation as successfully finished.
    pub fn complete(&mut self, response: serde_json::Value) {
        self.done = true;
        self.response = Some(response);
        self.error = None;
        self.modified_at = Timestamp::now();
    }

    /// Marks the operation as failed.
    pub fn fail(&mut self, error: &Error) {
        self.done = true;
        self.response = None;
        self.error = Some(OperationError::from(error));
        self.modified_at = Timestamp::now();
    }

    /// Returns `true` if the operation finished without error.
    pub fn is_success(&self) -> bool {
        self.done && self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_and_fails() {
        let mut op = Operation::new("connect /in", None);
        assert!(!op.done);

        op.complete(serde_json::json!({ "bytes": 6 }));
        assert!(op.is_success());

        op.fail(&Error::transient("peer unreachable"));
        assert!(op.done);
        assert!(!op.is_success());
        let error = op.error.clone().map(Error::from);
        assert_eq!(error.map(|e| e.kind()), Some(ErrorKind::Transient));
    }
}
