//! Response types for HTTP handlers.

mod error_response;
mod monitors;
mod sessions;

pub use error_response::ErrorResponse;
pub use monitors::*;
pub use sessions::*;
