//! HTTP request extractors with structured rejections.
//!
//! - [`Json`] and [`ValidateJson`] decode (and validate) request bodies.
//! - [`Path`] and [`Query`] decode path and query parameters.
//! - [`IdempotencyKey`] reads the optional key of long-running requests.

mod idempotency;
pub mod reject;

pub use crate::extract::idempotency::{IDEMPOTENCY_KEY_HEADER, IdempotencyKey};
pub use crate::extract::reject::{Json, Path, Query, ValidateJson};
