//! Internal error types for conduit-reqwest.

use conduit_core::ErrorKind;
use reqwest::StatusCode;
use thiserror::Error;

/// Result type alias for conduit-reqwest operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Internal error type for conduit-reqwest operations.
#[derive(Debug, Error)]
pub enum Error {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Invalid endpoint or slot URI.
    #[error("Invalid endpoint: {0}")]
    Endpoint(String),
    /// The peer answered with an error status.
    #[error("Peer answered {status}: {message}")]
    Status {
        /// HTTP status of the answer.
        status: StatusCode,
        /// Message carried in the error body.
        message: String,
    },
}

impl Error {
    /// Maps an HTTP status to the data-plane error kind it stands for.
    pub fn status_kind(status: StatusCode) -> ErrorKind {
        match status {
            StatusCode::NOT_FOUND => ErrorKind::NotFound,
            StatusCode::CONFLICT => ErrorKind::AlreadyExists,
            StatusCode::PRECONDITION_FAILED => ErrorKind::InvalidState,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorKind::InvalidInput,
            StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => ErrorKind::Transient,
            _ => ErrorKind::Backend,
        }
    }
}

impl From<Error> for conduit_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Reqwest(e) => {
                if e.is_timeout() {
                    conduit_core::Error::timeout(e.to_string()).with_source(e)
                } else if e.is_connect() {
                    conduit_core::Error::transient("connection to peer failed").with_source(e)
                } else if e.is_decode() || e.is_body() {
                    conduit_core::Error::transient(format!("peer stream broke: {e}")).with_source(e)
                } else {
                    conduit_core::Error::transient(e.to_string()).with_source(e)
                }
            }
            Error::Serde(e) => {
                conduit_core::Error::backend(format!("malformed peer payload: {e}")).with_source(e)
            }
            Error::Endpoint(message) => conduit_core::Error::invalid_input(message),
            Error::Status { status, message } => {
                conduit_core::Error::new(Error::status_kind(status)).with_message(message)
            }
        }
    }
}
