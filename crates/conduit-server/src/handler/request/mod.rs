//! Request types for HTTP handlers.

mod operations;
mod paths;
mod progress;
mod sessions;

pub use operations::*;
pub use paths::*;
pub use progress::*;
pub use sessions::*;
