//! CLI configuration management.
//!
//! ```text
//! Cli
//! ├── server: ServerConfig                # Host, port, shutdown
//! ├── recovery: RecoveryConfig            # Request timeout
//! ├── service: ServiceConfig              # Relay sessions, long-polls
//! ├── slots: SlotsConfig                  # Base URI, spool dir, worker pool
//! ├── storage: StorageConfig              # Snapshot and download storage
//! ├── http: ReqwestConfig                 # Peer and collaborator client
//! └── collaborators: CollaboratorConfig   # Channel manager, allocator
//! ```
//!
//! All configuration can be provided via CLI arguments or environment variables.
//! Use `--help` to see all available options.

mod collaborators;
mod provider;
mod server;

use std::process;

use anyhow::Context;
use clap::Parser;
pub use collaborators::CollaboratorConfig;
use conduit_reqwest::ReqwestConfig;
use conduit_server::middleware::RecoveryConfig;
use conduit_server::service::ServiceConfig;
use conduit_slots::SlotsConfig;
use conduit_storage::StorageConfig;
pub use provider::{Node, create_node};
pub use server::ServerConfig;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::{TRACING_TARGET_CONFIG, TRACING_TARGET_SERVER_STARTUP};

/// Complete CLI configuration of a data-plane node.
#[derive(Debug, Clone, Parser)]
#[command(name = "conduit")]
#[command(about = "Conduit data-plane node")]
#[command(version)]
pub struct Cli {
    /// Server network and lifecycle configuration.
    #[clap(flatten)]
    pub server: ServerConfig,

    /// Request timeout and panic recovery.
    #[clap(flatten)]
    pub recovery: RecoveryConfig,

    /// Relay session and operation limits.
    #[clap(flatten)]
    pub service: ServiceConfig,

    /// Slot registry and worker pool.
    #[clap(flatten)]
    pub slots: SlotsConfig,

    /// Storage backing snapshots and storage URIs.
    #[clap(flatten)]
    pub storage: StorageConfig,

    /// HTTP client used for peers and collaborators.
    #[clap(flatten)]
    pub http: ReqwestConfig,

    /// Channel manager and allocator.
    #[clap(flatten)]
    pub collaborators: CollaboratorConfig,
}

impl Cli {
    /// Loads environment variables from .env file (if enabled) and parses CLI arguments.
    pub fn init() -> Self {
        Self::load_dotenv();
        Self::parse()
    }

    #[cfg(feature = "dotenv")]
    fn load_dotenv() {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            eprintln!("Warning: failed to load .env file: {err}");
        }
    }

    #[cfg(not(feature = "dotenv"))]
    fn load_dotenv() {}

    /// Initializes tracing with environment-based filtering.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    fn log_build_info() {
        tracing::debug!(
            target: TRACING_TARGET_SERVER_STARTUP,
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            arch = std::env::consts::ARCH,
            os = std::env::consts::OS,
            features = ?Self::enabled_features(),
            "Build information"
        );
    }

    /// Validates all configuration values.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server
            .validate()
            .context("invalid server configuration")?;
        self.collaborators
            .validate()
            .context("invalid collaborator configuration")?;
        let base = self
            .slots
            .base_url()
            .context("invalid slots configuration")?;
        if !self.server.advertises(&base) {
            tracing::warn!(
                target: TRACING_TARGET_CONFIG,
                base_uri = %base,
                port = self.server.port,
                "Slots base URI points at another port than the listener"
            );
        }
        ServiceConfig::builder()
            .with_relay_command_timeout_ms(self.service.relay_command_timeout_ms)
            .with_max_wait_ms(self.service.max_wait_ms)
            .with_relay_stream_buffer(self.service.relay_stream_buffer)
            .with_relay_control_buffer(self.service.relay_control_buffer)
            .with_max_sessions(self.service.max_sessions)
            .build()
            .context("invalid service configuration")?;
        Ok(())
    }

    /// Logs configuration (no credentials).
    pub fn log(&self) {
        Self::log_build_info();
        self.server.log();
        self.collaborators.log();

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            base_uri = %self.slots.base_uri,
            tmp_dir = %self.slots.tmp_dir.display(),
            pool_size = self.slots.pool_size,
            "Slots configuration"
        );

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            backend = self.storage.backend_type.scheme(),
            bucket = self.storage.bucket(),
            endpoint = ?self.storage.endpoint,
            "Storage configuration"
        );

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            request_timeout_secs = self.recovery.request_timeout,
            relay_command_timeout_ms = self.service.relay_command_timeout_ms,
            max_sessions = self.service.max_sessions,
            "Request handling configuration"
        );
    }

    fn enabled_features() -> Vec<&'static str> {
        [
            cfg!(feature = "s3").then_some("s3"),
            cfg!(feature = "dotenv").then_some("dotenv"),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_are_valid() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from(["conduit"])?;
        cli.validate()?;
        assert_eq!(cli.server.port, 8080);
        assert!(cli.collaborators.allocator_url.is_none());
        Ok(())
    }
}
