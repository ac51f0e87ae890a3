//! Relay sessions for terminals that cannot be reached directly.

mod session;
mod sessions;

pub use session::{RelaySession, SessionLimits};
pub use sessions::RelaySessions;
