//! Data-plane error to HTTP error conversion.

use conduit_core::ErrorKind as SlotErrorKind;

use super::http_error::{Error as HttpError, ErrorKind};

/// Tracing target for data-plane error conversions.
const TRACING_TARGET: &str = "conduit_server::handler::error";

impl From<conduit_core::Error> for HttpError<'static> {
    fn from(error: conduit_core::Error) -> Self {
        let kind = match error.kind() {
            SlotErrorKind::NotFound => ErrorKind::NotFound,
            SlotErrorKind::AlreadyExists => ErrorKind::Conflict,
            SlotErrorKind::InvalidState => ErrorKind::PreconditionFailed,
            SlotErrorKind::InvalidInput => ErrorKind::BadRequest,
            SlotErrorKind::Transient => ErrorKind::BadGateway,
            SlotErrorKind::Timeout => ErrorKind::GatewayTimeout,
            SlotErrorKind::Cancelled => ErrorKind::ServiceUnavailable,
            SlotErrorKind::Backend | SlotErrorKind::Internal => ErrorKind::InternalServerError,
        };

        match kind {
            ErrorKind::InternalServerError => {
                tracing::error!(
                    target: TRACING_TARGET,
                    error = %error,
                    error_kind = error.kind_str(),
                    "Data-plane request failed"
                );
            }
            ErrorKind::BadGateway | ErrorKind::GatewayTimeout | ErrorKind::ServiceUnavailable => {
                tracing::warn!(
                    target: TRACING_TARGET,
                    error = %error,
                    error_kind = error.kind_str(),
                    "Data-plane collaborator unavailable"
                );
            }
            _ => {
                tracing::debug!(
                    target: TRACING_TARGET,
                    error = %error,
                    error_kind = error.kind_str(),
                    "Data-plane request rejected"
                );
            }
        }

        kind.with_message(error.message_or_kind().to_string())
            .with_context(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        let cases = [
            (conduit_core::Error::not_found("slot '/out' not found"), 404),
            (conduit_core::Error::already_exists("slot '/out' exists"), 409),
            (conduit_core::Error::invalid_state("slot '/out' is not an input"), 412),
            (conduit_core::Error::invalid_input("malformed slot uri"), 400),
            (conduit_core::Error::transient("peer unreachable"), 502),
            (conduit_core::Error::timeout("relay command timed out"), 504),
            (conduit_core::Error::backend("disk full"), 500),
        ];

        for (error, status) in cases {
            let error = HttpError::from(error);
            assert_eq!(error.kind().status_code().as_u16(), status);
        }
    }

    #[test]
    fn message_is_carried() {
        let error = HttpError::from(conduit_core::Error::not_found("slot '/out' not found"));
        assert_eq!(error.message(), Some("slot '/out' not found"));
    }
}
