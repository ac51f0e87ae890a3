//! Storage configuration types.

#[cfg(feature = "config")]
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Storage backend kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(AsRefStr, Display)]
#[cfg_attr(feature = "config", derive(ValueEnum))]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// Process-local memory, for tests and single-node runs.
    #[default]
    Memory,
    /// Local filesystem directory.
    Fs,
    /// Amazon S3 compatible storage.
    S3,
}

impl BackendType {
    /// URI scheme of locations stored in this backend.
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fs => "storage",
            Self::S3 => "s3",
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "config", derive(Args))]
#[must_use = "config does nothing unless you use it"]
pub struct StorageConfig {
    /// Storage backend type.
    #[cfg_attr(
        feature = "config",
        arg(long = "storage-backend", env = "STORAGE_BACKEND", value_enum, default_value = "memory")
    )]
    pub backend_type: BackendType,

    /// Bucket name (S3) or root directory (filesystem).
    #[cfg_attr(
        feature = "config",
        arg(long = "storage-root", env = "STORAGE_ROOT", default_value = "conduit")
    )]
    pub root: String,

    /// Region of the bucket.
    #[cfg_attr(feature = "config", arg(long = "storage-region", env = "STORAGE_REGION"))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint URL for S3-compatible storage.
    #[cfg_attr(feature = "config", arg(long = "storage-endpoint", env = "STORAGE_ENDPOINT"))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Access key ID.
    #[cfg_attr(
        feature = "config",
        arg(long = "storage-access-key-id", env = "STORAGE_ACCESS_KEY_ID")
    )]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,

    /// Secret access key.
    #[cfg_attr(
        feature = "config",
        arg(long = "storage-secret-access-key", env = "STORAGE_SECRET_ACCESS_KEY")
    )]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
}

impl StorageConfig {
    /// Creates an in-memory configuration rooted at `bucket`.
    pub fn memory(bucket: impl Into<String>) -> Self {
        Self {
            backend_type: BackendType::Memory,
            root: bucket.into(),
            region: None,
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }

    /// Creates a local filesystem configuration rooted at `root`.
    pub fn fs(root: impl Into<String>) -> Self {
        Self {
            backend_type: BackendType::Fs,
            ..Self::memory(root)
        }
    }

    /// Creates an S3 configuration for `bucket`.
    pub fn s3(bucket: impl Into<String>) -> Self {
        Self {
            backend_type: BackendType::S3,
            ..Self::memory(bucket)
        }
    }

    /// Sets the custom endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets the access credentials.
    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    /// Returns the bucket used in storage locations.
    pub fn bucket(&self) -> &str {
        match self.backend_type {
            BackendType::Fs => "local",
            BackendType::Memory | BackendType::S3 => &self.root,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::memory("conduit")
    }
}
