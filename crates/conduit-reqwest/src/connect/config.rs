//! Configuration for the reqwest client.

use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;

/// Default timeout for unary HTTP requests: 30 seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for establishing a peer connection: 5 seconds.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of lock stripes of the peer connection cache.
pub const DEFAULT_STRIPES: usize = 16;

/// Configuration for the reqwest HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(Args))]
#[must_use = "config does nothing unless you use it"]
pub struct ReqwestConfig {
    /// Timeout of unary requests in seconds. Streamed reads are not bounded.
    #[cfg_attr(
        feature = "config",
        arg(long = "http-timeout-secs", env = "HTTP_TIMEOUT_SECS", default_value_t = 30)
    )]
    pub timeout_secs: u64,

    /// Timeout for establishing a connection to a peer in seconds.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "http-connect-timeout-secs",
            env = "HTTP_CONNECT_TIMEOUT_SECS",
            default_value_t = 5,
        )
    )]
    pub connect_timeout_secs: u64,

    /// User-Agent header sent with every request.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "http-user-agent",
            env = "HTTP_USER_AGENT",
            default_value_t = default_user_agent(),
        )
    )]
    pub user_agent: String,

    /// Number of lock stripes of the peer connection cache.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "http-peer-stripes",
            env = "HTTP_PEER_STRIPES",
            default_value_t = DEFAULT_STRIPES,
        )
    )]
    pub stripes: usize,
}

fn default_user_agent() -> String {
    format!("conduit/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for ReqwestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            user_agent: default_user_agent(),
            stripes: DEFAULT_STRIPES,
        }
    }
}

impl ReqwestConfig {
    /// Sets the unary request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Returns the effective request timeout, using the default if zero.
    pub fn timeout(&self) -> Duration {
        match self.timeout_secs {
            0 => DEFAULT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    /// Returns the effective connect timeout, using the default if zero.
    pub fn connect_timeout(&self) -> Duration {
        match self.connect_timeout_secs {
            0 => DEFAULT_CONNECT_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    /// Returns the effective user agent, using the default if empty.
    pub fn user_agent(&self) -> String {
        if self.user_agent.is_empty() {
            default_user_agent()
        } else {
            self.user_agent.clone()
        }
    }
}
