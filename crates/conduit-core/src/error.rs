//! Common error type definitions.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, IntoStaticStr};
use thiserror::Error;

/// Type alias for boxed dynamic errors that can be sent across threads.
///
/// Used as the source error in structured error types, wrapping any error that
/// implements the standard `Error` trait while keeping `Send` and `Sync` bounds.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Type alias for Results with our custom Error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categories of errors that can occur in the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(AsRefStr, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Slot, task, session or operation is unknown.
    NotFound,
    /// Duplicate slot name, snapshot entry or snapshot id.
    AlreadyExists,
    /// Operation attempted on a slot in an incompatible state.
    InvalidState,
    /// Malformed request, URI or configuration.
    InvalidInput,
    /// Peer unreachable or storage endpoint down.
    Transient,
    /// A remote party did not answer in time.
    Timeout,
    /// Unrecoverable backend failure (disk full, corrupted stream).
    Backend,
    /// Work was cancelled before it finished.
    Cancelled,
    /// Logic error inside the data plane.
    Internal,
}

impl ErrorKind {
    /// Returns `true` if a caller may reasonably retry the whole operation.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

/// A structured error type for data-plane operations.
#[derive(Debug, Error)]
#[error("{}{}", .kind.as_ref(), .message.as_ref().map(|m| format!(": {}", m)).unwrap_or_default())]
pub struct Error {
    /// The kind of error that occurred.
    pub kind: ErrorKind,
    /// Optional error message.
    pub message: Option<String>,
    /// Optional source error.
    #[source]
    pub source: Option<BoxedError>,
}

impl Error {
    /// Creates a new error with the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Adds a message to this error.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Adds a source error to this error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Creates a new not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound).with_message(message)
    }

    /// Creates a new already exists error.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists).with_message(message)
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState).with_message(message)
    }

    /// Creates a new invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput).with_message(message)
    }

    /// Creates a new transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient).with_message(message)
    }

    /// Creates a new timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout).with_message(message)
    }

    /// Creates a new backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backend).with_message(message)
    }

    /// Creates a new cancelled error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(message)
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(message)
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error kind as a string.
    pub fn kind_str(&self) -> &'static str {
        self.kind.into()
    }

    /// Returns the message, or the kind name when no message was attached.
    pub fn message_or_kind(&self) -> &str {
        self.message.as_deref().unwrap_or_else(|| self.kind.as_ref())
    }

    /// Returns a copy of the kind and message without the source chain.
    ///
    /// Slot failures are observed by every blocked reader, so the stored
    /// error is duplicated instead of moved.
    pub fn detached(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            source: None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;

        let kind = match err.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidInput,
            IoKind::TimedOut => ErrorKind::Timeout,
            IoKind::ConnectionRefused
            | IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::NotConnected
            | IoKind::BrokenPipe
            | IoKind::UnexpectedEof => ErrorKind::Transient,
            _ => ErrorKind::Backend,
        };

        Self::new(kind).with_message(err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_input(err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let error = Error::not_found("slot /in not found");
        assert_eq!(error.to_string(), "not_found: slot /in not found");
        assert_eq!(Error::new(ErrorKind::Internal).to_string(), "internal");
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(Error::from(refused).kind(), ErrorKind::Transient);

        let other = std::io::Error::other("disk full");
        assert_eq!(Error::from(other).kind(), ErrorKind::Backend);
    }

    #[test]
    fn detached_drops_source() {
        let error = Error::from(std::io::Error::other("boom"));
        let copy = error.detached();
        assert_eq!(copy.kind(), error.kind());
        assert_eq!(copy.message, error.message);
        assert!(copy.source.is_none());
    }

    #[test]
    fn kind_serializes_snake_case() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&ErrorKind::AlreadyExists)?;
        assert_eq!(json, "\"already_exists\"");
        Ok(())
    }
}
