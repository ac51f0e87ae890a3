use std::borrow::Cow;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// JSON body of every failed request.
///
/// ```json
/// {
///   "name": "not_found",
///   "message": "output slot '/out' not found in task 't1'",
///   "resource": "slot"
/// }
/// ```
///
/// Peers read `message` back when they turn the status into a data-plane
/// error, so it carries the original error text.
#[must_use = "error responses do nothing unless serialized"]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse<'a> {
    pub name: Cow<'a, str>,
    pub message: Cow<'a, str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Cow<'a, str>>,
    /// Logged, never sent.
    #[serde(skip)]
    pub context: Option<Cow<'a, str>>,
    #[serde(skip)]
    pub status: StatusCode,
}

impl<'a> ErrorResponse<'a> {
    pub const fn new(name: &'a str, message: &'a str, status: StatusCode) -> Self {
        Self {
            name: Cow::Borrowed(name),
            message: Cow::Borrowed(message),
            resource: None,
            context: None,
            status,
        }
    }

    pub fn with_message(mut self, message: impl Into<Cow<'a, str>>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_resource(mut self, resource: impl Into<Cow<'a, str>>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<Cow<'a, str>>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl IntoResponse for ErrorResponse<'_> {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            if let Some(context) = self.context.as_deref() {
                tracing::debug!(
                    target: "conduit_server::handler::error",
                    status = self.status.as_u16(),
                    name = %self.name,
                    context,
                    "Answering with a server error"
                );
            }
        }
        (self.status, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_and_status_stay_out_of_the_body() -> anyhow::Result<()> {
        let response = ErrorResponse::new(
            "precondition_failed",
            "Slot state does not allow this request.",
            StatusCode::PRECONDITION_FAILED,
        )
        .with_resource("slot")
        .with_message("slot '/out' is not an input slot")
        .with_context("connect rejected");

        let json = serde_json::to_value(&response)?;
        assert_eq!(json["name"], "precondition_failed");
        assert_eq!(json["message"], "slot '/out' is not an input slot");
        assert_eq!(json["resource"], "slot");
        assert!(json.get("context").is_none());
        assert!(json.get("status").is_none());
        Ok(())
    }
}
