//! Handler error: a status-bearing kind plus what the client and the logs see.

use std::borrow::Cow;
use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::handler::response::ErrorResponse;

/// Error returned by every handler.
///
/// The message and resource reach the client; the context only reaches logs.
#[derive(Debug, Clone)]
#[must_use = "errors do nothing unless serialized"]
pub struct Error<'a> {
    kind: ErrorKind,
    context: Option<Cow<'a, str>>,
    message: Option<Cow<'a, str>>,
    resource: Option<Cow<'a, str>>,
}

impl Error<'static> {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            message: None,
            resource: None,
        }
    }
}

impl<'a> Error<'a> {
    /// Attaches diagnostic context kept out of the response body.
    pub fn with_context(mut self, context: impl Into<Cow<'a, str>>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Replaces the kind's generic message.
    pub fn with_message(mut self, message: impl Into<Cow<'a, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Names what the request was about: a slot, a session, an operation.
    pub fn with_resource(mut self, resource: impl Into<Cow<'a, str>>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }
}

impl fmt::Display for Error<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, status, generic) = self.kind.describe();
        write!(f, "{name} ({}): {}", status.as_u16(), self.message().unwrap_or(generic))?;
        if let Some(resource) = self.resource() {
            write!(f, " [{resource}]")?;
        }
        if let Some(context) = self.context() {
            write!(f, " - {context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error<'_> {}

impl IntoResponse for Error<'_> {
    fn into_response(self) -> Response {
        let mut body = self.kind.response();
        if let Some(message) = self.message {
            body = body.with_message(message);
        }
        if let Some(resource) = self.resource {
            body = body.with_resource(resource);
        }
        if let Some(context) = self.context {
            body = body.with_context(context);
        }
        body.into_response()
    }
}

impl From<ErrorKind> for Error<'static> {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

/// Handler result.
pub type Result<T, E = Error<'static>> = std::result::Result<T, E>;

/// Statuses the slot API answers with.
#[must_use = "error kinds do nothing unless used to create errors"]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A route parameter is absent.
    MissingPathParam,
    /// Malformed slot URI, body or query.
    BadRequest,
    /// Unknown slot, task, session or operation.
    NotFound,
    /// Duplicate slot, snapshot or snapshot entry.
    Conflict,
    /// The slot's state or direction does not allow the call.
    PreconditionFailed,
    #[default]
    InternalServerError,
    /// A peer, terminal or storage could not be reached.
    BadGateway,
    /// The node is shutting down.
    ServiceUnavailable,
    /// A relayed command got no answer in time.
    GatewayTimeout,
}

impl ErrorKind {
    pub fn with_context<'a>(self, context: impl Into<Cow<'a, str>>) -> Error<'a> {
        Error::new(self).with_context(context)
    }

    pub fn with_message<'a>(self, message: impl Into<Cow<'a, str>>) -> Error<'a> {
        Error::new(self).with_message(message)
    }

    pub fn with_resource<'a>(self, resource: impl Into<Cow<'a, str>>) -> Error<'a> {
        Error::new(self).with_resource(resource)
    }

    pub fn status_code(self) -> StatusCode {
        self.describe().1
    }

    /// Returns the response body of this kind before any customization.
    pub fn response(self) -> ErrorResponse<'static> {
        let (name, status, message) = self.describe();
        ErrorResponse::new(name, message, status)
    }

    const fn describe(self) -> (&'static str, StatusCode, &'static str) {
        match self {
            Self::MissingPathParam => (
                "missing_path_param",
                StatusCode::BAD_REQUEST,
                "Missing path parameter.",
            ),
            Self::BadRequest => ("bad_request", StatusCode::BAD_REQUEST, "Invalid request data."),
            Self::NotFound => ("not_found", StatusCode::NOT_FOUND, "Resource not found."),
            Self::Conflict => ("conflict", StatusCode::CONFLICT, "Resource already exists."),
            Self::PreconditionFailed => (
                "precondition_failed",
                StatusCode::PRECONDITION_FAILED,
                "Slot state does not allow this request.",
            ),
            Self::InternalServerError => (
                "internal_server_error",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error.",
            ),
            Self::BadGateway => (
                "bad_gateway",
                StatusCode::BAD_GATEWAY,
                "Upstream peer unavailable.",
            ),
            Self::ServiceUnavailable => (
                "service_unavailable",
                StatusCode::SERVICE_UNAVAILABLE,
                "Node is shutting down.",
            ),
            Self::GatewayTimeout => (
                "gateway_timeout",
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream peer did not answer in time.",
            ),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe().0)
    }
}

impl IntoResponse for ErrorKind {
    fn into_response(self) -> Response {
        self.response().into_response()
    }
}
