use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Default values for configuration options.
mod defaults {
    /// Time a relayed command waits for the terminal's reply.
    pub const RELAY_COMMAND_TIMEOUT_MS: u64 = 10_000;

    /// Longest long-poll of an operation lookup.
    pub const MAX_WAIT_MS: u64 = 30_000;

    /// Frames buffered per relayed output stream.
    pub const RELAY_STREAM_BUFFER: usize = 64;

    /// Commands buffered per session control channel.
    pub const RELAY_CONTROL_BUFFER: usize = 256;

    /// Maximum number of concurrent relay sessions.
    pub const MAX_SESSIONS: usize = 1024;
}

/// App [`state`] configuration.
///
/// [`state`]: crate::service::ServiceState
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[cfg_attr(feature = "config", derive(Args))]
#[must_use = "config does nothing unless you use it"]
#[builder(
    pattern = "owned",
    setter(into, strip_option, prefix = "with"),
    build_fn(validate = "Self::validate")
)]
pub struct ServiceConfig {
    /// Milliseconds a relayed command waits for the terminal's reply.
    #[builder(default = "defaults::RELAY_COMMAND_TIMEOUT_MS")]
    #[cfg_attr(
        feature = "config",
        arg(
            long = "relay-command-timeout-ms",
            env = "RELAY_COMMAND_TIMEOUT_MS",
            default_value_t = defaults::RELAY_COMMAND_TIMEOUT_MS,
        )
    )]
    pub relay_command_timeout_ms: u64,

    /// Longest long-poll of an operation lookup in milliseconds.
    #[builder(default = "defaults::MAX_WAIT_MS")]
    #[cfg_attr(
        feature = "config",
        arg(long = "max-wait-ms", env = "MAX_WAIT_MS", default_value_t = defaults::MAX_WAIT_MS)
    )]
    pub max_wait_ms: u64,

    /// Frames buffered per relayed output stream.
    #[builder(default = "defaults::RELAY_STREAM_BUFFER")]
    #[cfg_attr(
        feature = "config",
        arg(
            long = "relay-stream-buffer",
            env = "RELAY_STREAM_BUFFER",
            default_value_t = defaults::RELAY_STREAM_BUFFER,
        )
    )]
    pub relay_stream_buffer: usize,

    /// Commands buffered per session control channel.
    #[builder(default = "defaults::RELAY_CONTROL_BUFFER")]
    #[cfg_attr(
        feature = "config",
        arg(
            long = "relay-control-buffer",
            env = "RELAY_CONTROL_BUFFER",
            default_value_t = defaults::RELAY_CONTROL_BUFFER,
        )
    )]
    pub relay_control_buffer: usize,

    /// Maximum number of concurrent relay sessions.
    #[builder(default = "defaults::MAX_SESSIONS")]
    #[cfg_attr(
        feature = "config",
        arg(
            long = "relay-max-sessions",
            env = "RELAY_MAX_SESSIONS",
            default_value_t = defaults::MAX_SESSIONS,
        )
    )]
    pub max_sessions: usize,
}

impl ServiceConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Returns the relayed command timeout.
    pub fn relay_command_timeout(&self) -> Duration {
        Duration::from_millis(self.relay_command_timeout_ms)
    }

    /// Returns the longest operation long-poll.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            relay_command_timeout_ms: defaults::RELAY_COMMAND_TIMEOUT_MS,
            max_wait_ms: defaults::MAX_WAIT_MS,
            relay_stream_buffer: defaults::RELAY_STREAM_BUFFER,
            relay_control_buffer: defaults::RELAY_CONTROL_BUFFER,
            max_sessions: defaults::MAX_SESSIONS,
        }
    }
}

impl ServiceConfigBuilder {
    /// Wrapper for builder validation that returns String errors.
    fn validate(builder: &ServiceConfigBuilder) -> Result<(), String> {
        if let Some(timeout_ms) = builder.relay_command_timeout_ms {
            if timeout_ms == 0 {
                return Err("Relay command timeout must be greater than 0".to_string());
            }
            if timeout_ms > 300_000 {
                return Err("Relay command timeout cannot exceed 300 seconds".to_string());
            }
        }

        if let Some(max_wait_ms) = builder.max_wait_ms
            && max_wait_ms > 60_000
        {
            return Err("Operation long-poll cannot exceed 60 seconds".to_string());
        }

        if builder.relay_stream_buffer == Some(0) {
            return Err("Relay stream buffer must hold at least one frame".to_string());
        }

        if builder.relay_control_buffer == Some(0) {
            return Err("Relay control buffer must hold at least one command".to_string());
        }

        if builder.max_sessions == Some(0) {
            return Err("Relay session limit must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_uses_defaults() -> anyhow::Result<()> {
        let config = ServiceConfig::builder().build()?;
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.relay_command_timeout(), Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn builder_rejects_invalid_values() {
        assert!(
            ServiceConfig::builder()
                .with_relay_command_timeout_ms(0u64)
                .build()
                .is_err()
        );
        assert!(
            ServiceConfig::builder()
                .with_max_wait_ms(120_000u64)
                .build()
                .is_err()
        );
        assert!(ServiceConfig::builder().with_max_sessions(0usize).build().is_err());
    }
}
