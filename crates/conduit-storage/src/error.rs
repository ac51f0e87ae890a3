//! Storage errors and their data-plane kinds.

use conduit_core::{Error, ErrorKind};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure of an object store or of the snapshot registry.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The operator could not be built from the configuration.
    #[error("cannot open storage: {0}")]
    Init(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Snapshot ids and snapshot entries are single use.
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("access to {0} denied")]
    PermissionDenied(String),

    /// An upload was aborted because its source stream failed.
    #[error("upload aborted: {0}")]
    Write(String),

    /// Not a key or URI this backend can address.
    #[error("bad storage location: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Backend(opendal::Error),
}

impl StorageError {
    pub fn init(msg: impl Into<String>) -> Self {
        Self::Init(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    pub fn write(msg: impl Into<String>) -> Self {
        Self::Write(msg.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }
}

impl From<opendal::Error> for StorageError {
    fn from(err: opendal::Error) -> Self {
        match err.kind() {
            opendal::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            opendal::ErrorKind::AlreadyExists => Self::AlreadyExists(err.to_string()),
            opendal::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Backend(err),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        let kind = match &err {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::Init(_) | StorageError::InvalidPath(_) => ErrorKind::InvalidInput,
            StorageError::PermissionDenied(_) => ErrorKind::Backend,
            StorageError::Write(_) | StorageError::Backend(_) => ErrorKind::Transient,
        };

        Error::new(kind).with_message(err.to_string()).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_data_plane_kinds() {
        let error = Error::from(StorageError::already_exists("entry '/out' of snapshot 's1'"));
        assert_eq!(error.kind(), ErrorKind::AlreadyExists);
        assert!(error.to_string().contains("'/out'"));

        let error = Error::from(StorageError::write("connection reset"));
        assert_eq!(error.kind(), ErrorKind::Transient);
        assert!(error.kind().is_retryable());

        let error = Error::from(StorageError::invalid_path("s3://"));
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }
}
