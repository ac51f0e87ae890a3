//! Failures of running a node, with an operator hint for each.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server operations.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Errors of serving a node.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cannot listen on {address}: {source}")]
    BindError {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The accept loop stopped on an I/O error.
    #[error("Listener failed: {0}")]
    Runtime(#[source] io::Error),

    /// Slots or relay sessions were still busy when shutdown gave up.
    #[error("Shutdown did not complete: {0}")]
    Drain(#[source] conduit_core::Error),
}

impl ServerError {
    pub fn bind_error(address: SocketAddr, source: io::Error) -> Self {
        Self::BindError { address, source }
    }

    /// Stable code logged with the failure.
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "conduit.config",
            Self::BindError { .. } => "conduit.bind",
            Self::Runtime(_) => "conduit.listener",
            Self::Drain(_) => "conduit.drain",
        }
    }

    /// Whether restarting the node, maybe after fixing its environment,
    /// can succeed without a configuration change.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::InvalidConfig(_) => false,
            Self::BindError { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::AddrInUse
                    | io::ErrorKind::AddrNotAvailable
                    | io::ErrorKind::PermissionDenied
            ),
            Self::Runtime(err) => {
                matches!(err.kind(), io::ErrorKind::Interrupted | io::ErrorKind::TimedOut)
            }
            Self::Drain(err) => err.kind().is_retryable(),
        }
    }

    /// Hint for the operator, when there is a useful one.
    pub fn suggestion(&self) -> Option<&'static str> {
        let hint = match self {
            Self::InvalidConfig(_) => {
                "Check the flags and environment variables the node was started with"
            }
            Self::BindError { source, .. } => match source.kind() {
                io::ErrorKind::AddrInUse => "Another process holds the port; pick another PORT",
                io::ErrorKind::PermissionDenied => "Ports below 1024 need elevated privileges",
                io::ErrorKind::AddrNotAvailable => "HOST is not an address of this machine",
                _ => "Check the network configuration of the VM",
            },
            Self::Runtime(err) if err.kind() == io::ErrorKind::TimedOut => {
                "The listener timed out; restart the node"
            }
            Self::Runtime(_) => return None,
            Self::Drain(_) => {
                "Transfers were still running; raise SHUTDOWN_TIMEOUT \
                 or lower the slot close timeout"
            }
        };
        Some(hint)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[test]
    fn codes_are_distinct() {
        let errors = [
            ServerError::InvalidConfig("port".into()),
            ServerError::bind_error(addr(), io::Error::other("bind")),
            ServerError::Runtime(io::Error::other("accept")),
            ServerError::Drain(conduit_core::Error::timeout("slots still open")),
        ];

        let codes: HashSet<_> = errors.iter().map(ServerError::error_code).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn busy_port_is_recoverable() {
        let error = ServerError::bind_error(addr(), io::ErrorKind::AddrInUse.into());
        assert!(error.is_recoverable());
        assert!(error.suggestion().is_some_and(|s| s.contains("PORT")));
        assert!(error.to_string().contains("127.0.0.1:9000"));
    }

    #[test]
    fn timed_out_drain_is_recoverable() {
        let error = ServerError::Drain(conduit_core::Error::timeout("slots still open"));
        assert!(error.is_recoverable());
        assert!(error.suggestion().is_some());
    }

    #[test]
    fn bad_config_is_final() {
        let error = ServerError::InvalidConfig("port 80 is reserved".into());
        assert!(!error.is_recoverable());
        assert!(error.suggestion().is_some());
        assert!(ServerError::Runtime(io::Error::other("accept")).suggestion().is_none());
    }
}
