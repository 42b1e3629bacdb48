use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

pub mod s3;

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum ObjectStorageError {
    #[error("Object storage unavailable for key `{key}`.")]
    StorageUnavailable { key: String, raw_error_message: String },
    #[error("Object storage quota exceeded while writing key `{key}`.")]
    QuotaExceeded { key: String, raw_error_message: String },
    #[error("Invalid object key `{key}`: {reason}.")]
    InvalidKey { key: String, reason: String },
    #[error("Object `{key}` not found.")]
    ObjectNotFound { key: String },
    #[error("Cannot presign URL for key `{key}`.")]
    CannotPresign { key: String, raw_error_message: String },
}

impl ObjectStorageError {
    pub fn raw_error_message(&self) -> Option<String> {
        match self {
            ObjectStorageError::StorageUnavailable { raw_error_message, .. }
            | ObjectStorageError::QuotaExceeded { raw_error_message, .. }
            | ObjectStorageError::CannotPresign { raw_error_message, .. } => Some(raw_error_message.clone()),
            ObjectStorageError::InvalidKey { .. } | ObjectStorageError::ObjectNotFound { .. } => None,
        }
    }
}

/// ObjectStorage: thin gateway over an S3-compatible store. The controller
/// only ever writes under the temp prefix; expiry is bucket policy, so no
/// delete operation exists here.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Idempotent overwrite.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStorageError>;

    /// Time-bounded GET URL consumed by the builder container.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<Url, ObjectStorageError>;
}

/// Keys are namespaced `tmp/<namespace>/<function>/<fingerprint>.tar`; anything
/// escaping the temp prefix is rejected before it reaches the store.
pub fn validate_key(key: &str) -> Result<(), ObjectStorageError> {
    let invalid = |reason: &str| ObjectStorageError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("key cannot be empty"));
    }
    if !key.starts_with("tmp/") {
        return Err(invalid("key must live under the tmp/ prefix"));
    }
    if key.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Err(invalid("key cannot contain empty or relative segments"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'))
    {
        return Err(invalid("key contains characters outside [A-Za-z0-9/._-]"));
    }

    Ok(())
}
