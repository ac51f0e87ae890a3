use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::handler::{Error, ErrorKind};

/// Header carrying the idempotency key of a long-running request.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Longest accepted idempotency key.
const MAX_KEY_LEN: usize = 256;

/// Optional `Idempotency-Key` of a long-running request.
///
/// Retried requests carrying the same key resolve to the operation the
/// first request started.
#[must_use]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub Option<String>);

impl IdempotencyKey {
    /// Returns the key, if the request carried one.
    #[inline]
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = Error<'static>;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(IDEMPOTENCY_KEY_HEADER) else {
            return Ok(Self(None));
        };

        let key = value.to_str().map_err(|_| {
            ErrorKind::BadRequest.with_message("Idempotency key must be visible ASCII")
        })?;
        let key = key.trim();

        match key.len() {
            0 => Ok(Self(None)),
            len if len > MAX_KEY_LEN => Err(ErrorKind::BadRequest
                .with_message(format!("Idempotency key exceeds {MAX_KEY_LEN} characters"))),
            _ => Ok(Self(Some(key.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::Request;

    use super::*;

    async fn extract(header: Option<&str>) -> Result<IdempotencyKey, Error<'static>> {
        let mut builder = Request::builder().uri("/slots/connect");
        if let Some(header) = header {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, header);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        IdempotencyKey::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_optional_key() {
        assert_eq!(extract(None).await.unwrap(), IdempotencyKey(None));
        assert_eq!(extract(Some("  ")).await.unwrap(), IdempotencyKey(None));
        assert_eq!(
            extract(Some("retry-1")).await.unwrap().as_deref(),
            Some("retry-1")
        );

        let long = "k".repeat(MAX_KEY_LEN + 1);
        let error = extract(Some(&long)).await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::BadRequest);
    }
}
