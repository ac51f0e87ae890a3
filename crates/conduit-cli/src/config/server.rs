//! Listener and shutdown settings of the slot API.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{Result as AnyhowResult, bail};
use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::TRACING_TARGET_CONFIG;

/// Lowest port the node listens on without extra privileges.
const MIN_PORT: u16 = 1024;

/// Upper bound of the shutdown budget in seconds.
const MAX_SHUTDOWN_SECS: u64 = 300;

/// Where the slot API listens and how long it may take to stop.
///
/// Other nodes reach this listener through the slots base URI, so the two
/// are expected to agree on the port.
///
/// ```bash
/// conduit --host 0.0.0.0 --port 9000 --slots-base-uri fs://10.0.0.5:9000
/// HOST=0.0.0.0 PORT=9000 SHUTDOWN_TIMEOUT=60 conduit
/// ```
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[must_use = "config does nothing unless you use it"]
pub struct ServerConfig {
    /// Address the slot API binds to; 0.0.0.0 accepts peers on every interface.
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    #[serde(default = "loopback")]
    pub host: IpAddr,

    /// Port the slot API listens on.
    #[arg(short = 'p', long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Seconds allowed for stopping: in-flight requests, relay sessions
    /// and busy slots all drain within this budget.
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout: u64,
}

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

impl ServerConfig {
    /// Rejects privileged ports and shutdown budgets outside `1..=300` seconds.
    pub fn validate(&self) -> AnyhowResult<()> {
        if self.port < MIN_PORT {
            bail!("port {} needs elevated privileges, pick one from {MIN_PORT}", self.port);
        }

        if !(1..=MAX_SHUTDOWN_SECS).contains(&self.shutdown_timeout) {
            bail!(
                "shutdown timeout of {}s is outside 1..={MAX_SHUTDOWN_SECS}s",
                self.shutdown_timeout
            );
        }

        Ok(())
    }

    /// Socket address the listener binds.
    #[must_use]
    pub const fn server_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Shutdown budget.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    #[must_use]
    pub const fn binds_to_all_interfaces(&self) -> bool {
        self.host.is_unspecified()
    }

    /// Returns `true` if peers following `base` reach this listener's port.
    #[must_use]
    pub fn advertises(&self, base: &Url) -> bool {
        base.port_or_known_default() == Some(self.port)
    }

    pub fn log(&self) {
        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            addr = %self.server_addr(),
            shutdown_timeout_secs = self.shutdown_timeout,
            "Listener configuration"
        );
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: loopback(),
            port: 8080,
            shutdown_timeout: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_listen_on_loopback() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.binds_to_all_interfaces());
        assert_eq!(config.server_addr(), "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn privileged_port_and_unbounded_shutdown_are_rejected() {
        let config = ServerConfig {
            port: 443,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        for (secs, ok) in [(0, false), (301, false), (300, true)] {
            let config = ServerConfig {
                shutdown_timeout: secs,
                ..ServerConfig::default()
            };
            assert_eq!(config.validate().is_ok(), ok, "shutdown_timeout = {secs}");
        }
    }

    #[test]
    fn base_uri_port_must_match_listener() -> anyhow::Result<()> {
        let config = ServerConfig {
            port: 9000,
            ..ServerConfig::default()
        };
        assert!(config.advertises(&Url::parse("fs://10.0.0.5:9000")?));
        assert!(!config.advertises(&Url::parse("fs://10.0.0.5:9001")?));
        Ok(())
    }
}
