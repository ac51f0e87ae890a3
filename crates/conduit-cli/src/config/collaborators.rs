//! Addresses of the collaborators a node reports to.

use std::time::Duration;

use anyhow::{Result as AnyhowResult, anyhow};
use clap::Args;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::TRACING_TARGET_CONFIG;

/// Channel manager and allocator configuration.
///
/// Without a channel manager URL the node wires channels in process; without
/// an allocator URL it runs standalone.
#[derive(Debug, Clone, Default, Args, Serialize, Deserialize)]
#[must_use = "config does nothing unless you use it"]
pub struct CollaboratorConfig {
    /// Base URL of the channel manager.
    #[arg(long, env = "CHANNEL_MANAGER_URL")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_manager_url: Option<Url>,

    /// Base URL of the allocator.
    #[arg(long, env = "ALLOCATOR_URL")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocator_url: Option<Url>,

    /// Identifier this node registers under.
    #[arg(long, env = "VM_ID", default_value = "")]
    #[serde(default)]
    pub vm_id: String,

    /// Seconds between allocator heartbeats.
    #[arg(long, env = "HEARTBEAT_INTERVAL", default_value_t = 10)]
    pub heartbeat_interval: u64,
}

impl CollaboratorConfig {
    /// Validates the allocator settings.
    pub fn validate(&self) -> AnyhowResult<()> {
        if self.allocator_url.is_some() && self.vm_id.trim().is_empty() {
            return Err(anyhow!("A VM id is required when an allocator URL is set"));
        }

        if self.heartbeat_interval == 0 {
            return Err(anyhow!("Heartbeat interval must be at least one second"));
        }

        Ok(())
    }

    /// Returns the heartbeat period.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Logs collaborator configuration at info level.
    pub fn log(&self) {
        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            channel_manager = ?self.channel_manager_url.as_ref().map(Url::as_str),
            allocator = ?self.allocator_url.as_ref().map(Url::as_str),
            vm_id = %self.vm_id,
            heartbeat_interval_secs = self.heartbeat_interval,
            "Collaborator configuration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_needs_a_vm_id() -> anyhow::Result<()> {
        let mut config = CollaboratorConfig {
            heartbeat_interval: 10,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.allocator_url = Some(Url::parse("http://allocator.local:7100")?);
        assert!(config.validate().is_err());

        config.vm_id = "vm-17".into();
        assert!(config.validate().is_ok());

        config.heartbeat_interval = 0;
        assert!(config.validate().is_err());
        Ok(())
    }
}
