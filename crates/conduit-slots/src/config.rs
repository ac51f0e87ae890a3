//! Slot service configuration.

use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "config")]
use clap::Args;
use conduit_core::{Error, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Default number of concurrent long-running slot operations.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Default interval between drain rechecks while closing the registry.
pub const DEFAULT_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Default number of drain rechecks while closing the registry.
pub const DEFAULT_CLOSE_RECHECKS: u32 = 100;

/// Configuration of the slot registry and service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
#[must_use = "config does nothing unless you use it"]
pub struct SlotsConfig {
    /// Base URI under which this node's slots are advertised, e.g. `fs://10.0.0.5:8080`.
    #[cfg_attr(
        feature = "config",
        arg(long = "slots-base-uri", env = "SLOTS_BASE_URI", default_value = "fs://127.0.0.1:8080")
    )]
    pub base_uri: String,

    /// Directory holding spool files of file slots.
    #[cfg_attr(
        feature = "config",
        arg(long = "slots-tmp-dir", env = "SLOTS_TMP_DIR", default_value = "/tmp/conduit")
    )]
    pub tmp_dir: PathBuf,

    /// Maximum number of concurrent connect and destroy operations.
    #[cfg_attr(
        feature = "config",
        arg(long = "slots-pool-size", env = "SLOTS_POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)
    )]
    pub pool_size: usize,

    /// Milliseconds between drain rechecks when closing the registry.
    #[cfg_attr(
        feature = "config",
        arg(long = "slots-close-wait-ms", env = "SLOTS_CLOSE_WAIT_MS", default_value_t = 1000)
    )]
    pub close_wait_ms: u64,

    /// Number of drain rechecks before closing gives up.
    #[cfg_attr(
        feature = "config",
        arg(
            long = "slots-close-rechecks",
            env = "SLOTS_CLOSE_RECHECKS",
            default_value_t = DEFAULT_CLOSE_RECHECKS,
        )
    )]
    pub close_rechecks: u32,
}

impl SlotsConfig {
    /// Creates a configuration advertising slots under `base_uri`.
    pub fn new(base_uri: impl Into<String>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_uri: base_uri.into(),
            tmp_dir: tmp_dir.into(),
            pool_size: DEFAULT_POOL_SIZE,
            close_wait_ms: DEFAULT_CLOSE_WAIT.as_millis() as u64,
            close_rechecks: DEFAULT_CLOSE_RECHECKS,
        }
    }

    /// Sets the worker pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the drain policy of [`SlotRegistry::close`](crate::SlotRegistry::close).
    pub fn with_close_policy(mut self, wait: Duration, rechecks: u32) -> Self {
        self.close_wait_ms = wait.as_millis() as u64;
        self.close_rechecks = rechecks;
        self
    }

    /// Parses the base URI.
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_uri).map_err(|e| {
            Error::invalid_input(format!("invalid slots base uri '{}'", self.base_uri))
                .with_source(e)
        })?;
        if url.host_str().is_none() {
            return Err(Error::invalid_input(format!(
                "slots base uri '{}' has no host",
                self.base_uri
            )));
        }
        Ok(url)
    }

    /// Returns the interval between drain rechecks.
    pub fn close_wait(&self) -> Duration {
        Duration::from_millis(self.close_wait_ms)
    }
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self::new("fs://127.0.0.1:8080", std::env::temp_dir().join("conduit"))
    }
}
