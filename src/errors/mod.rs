use std::fmt::{Display, Formatter};

use crate::build_context::BuildContextError;
use crate::job::JobError;
use crate::kube_client::KubeAdapterError;
use crate::msg_publisher::PublishError;
use crate::object_storage::ObjectStorageError;
use crate::service::ServiceError;

/// ErrorKind: the closed failure taxonomy every component maps into.
/// Retryability is a property of the kind, not of the call site.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Malformed event or spec. Never retried.
    Validation,
    /// Policy or RBAC denies the operation. Never retried.
    Forbidden,
    /// Targeted resource absent. Success on idempotent delete paths.
    NotFound,
    /// Resource already present; a regular outcome of create paths.
    AlreadyExists,
    /// Optimistic-concurrency collision. Retried locally with bounded attempts.
    Conflict,
    /// Network or availability failure. Retried with exponential backoff.
    Transient,
    /// Deadline expired; the caller decides whether to retry.
    Timeout,
    /// Queue full, LRU full or a configured cap hit. Retryable after backoff.
    ResourceExhausted,
    /// A bug. Escapes as 5xx with a correlation id.
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict | ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::ResourceExhausted
        )
    }

    /// Wire representation used in lifecycle `.failed` payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ErrorMessageVerbosity: which rendition of an error message is wanted.
pub enum ErrorMessageVerbosity {
    SafeOnly,
    FullDetails,
}

/// EngineError: the error type crossing component boundaries. Component
/// errors carry their own structure; this carries the taxonomy plus a
/// user-safe message and the raw details kept out of user-facing payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineError {
    kind: ErrorKind,
    message_safe: String,
    full_details: Option<String>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message_safe: String, full_details: Option<String>) -> Self {
        EngineError {
            kind,
            message_safe,
            full_details,
        }
    }

    pub fn new_from_safe(kind: ErrorKind, message_safe: String) -> Self {
        Self::new(kind, message_safe, None)
    }

    pub fn new_internal(message_safe: String, full_details: Option<String>) -> Self {
        Self::new(ErrorKind::Internal, message_safe, full_details)
    }

    pub fn new_timeout(what: &str) -> Self {
        Self::new_from_safe(ErrorKind::Timeout, format!("Deadline expired while {what}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn message(&self, verbosity: ErrorMessageVerbosity) -> String {
        match verbosity {
            ErrorMessageVerbosity::SafeOnly => self.message_safe.clone(),
            ErrorMessageVerbosity::FullDetails => match &self.full_details {
                None => self.message_safe.clone(),
                Some(details) => format!("{} / Full details: {}", self.message_safe, details),
            },
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // By default, expose the safe message only
        write!(f, "{}: {}", self.kind, self.message_safe)
    }
}

impl std::error::Error for EngineError {}

impl From<ObjectStorageError> for EngineError {
    fn from(err: ObjectStorageError) -> Self {
        let kind = match &err {
            ObjectStorageError::StorageUnavailable { .. } => ErrorKind::Transient,
            ObjectStorageError::QuotaExceeded { .. } => ErrorKind::ResourceExhausted,
            ObjectStorageError::InvalidKey { .. } => ErrorKind::Validation,
            ObjectStorageError::ObjectNotFound { .. } => ErrorKind::NotFound,
            ObjectStorageError::CannotPresign { .. } => ErrorKind::Internal,
        };
        EngineError::new(kind, err.to_string(), err.raw_error_message())
    }
}

impl From<BuildContextError> for EngineError {
    fn from(err: BuildContextError) -> Self {
        match err {
            BuildContextError::TemplateMissing { .. } => {
                EngineError::new_from_safe(ErrorKind::Validation, err.to_string())
            }
            BuildContextError::ArchiveTooLarge { .. } => {
                EngineError::new_from_safe(ErrorKind::Validation, err.to_string())
            }
            BuildContextError::InvalidSource { .. } => {
                EngineError::new_from_safe(ErrorKind::Validation, err.to_string())
            }
            BuildContextError::Io { ref raw_error_message } => {
                EngineError::new(ErrorKind::Internal, err.to_string(), Some(raw_error_message.clone()))
            }
            BuildContextError::Storage(storage_err) => storage_err.into(),
        }
    }
}

impl From<KubeAdapterError> for EngineError {
    fn from(err: KubeAdapterError) -> Self {
        let kind = match &err {
            KubeAdapterError::NotFound { .. } => ErrorKind::NotFound,
            KubeAdapterError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            KubeAdapterError::Conflict { .. } => ErrorKind::Conflict,
            KubeAdapterError::Forbidden { .. } => ErrorKind::Forbidden,
            KubeAdapterError::Timeout { .. } => ErrorKind::Timeout,
            KubeAdapterError::Transient { .. } => ErrorKind::Transient,
            KubeAdapterError::InvalidResource { .. } => ErrorKind::Validation,
        };
        EngineError::new(kind, err.to_string(), err.raw_error_message())
    }
}

impl From<JobError> for EngineError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::ConcurrencyCapReached { .. } => {
                EngineError::new_from_safe(ErrorKind::ResourceExhausted, err.to_string())
            }
            JobError::CreateConflict { .. } => EngineError::new_from_safe(ErrorKind::Conflict, err.to_string()),
            JobError::MissingBuildContext { .. } => EngineError::new_from_safe(ErrorKind::Validation, err.to_string()),
            JobError::Kube(kube_err) => kube_err.into(),
        }
    }
}

impl From<ServiceError> for EngineError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::ConflictRetriesExhausted { .. } => {
                // Local retries are done; the caller only sees a retryable failure
                EngineError::new_from_safe(ErrorKind::Transient, err.to_string())
            }
            ServiceError::MissingImage { .. } => EngineError::new_from_safe(ErrorKind::Validation, err.to_string()),
            ServiceError::Kube(kube_err) => kube_err.into(),
        }
    }
}

impl From<PublishError> for EngineError {
    fn from(err: PublishError) -> Self {
        let kind = match &err {
            PublishError::BrokerUnreachable { .. } => ErrorKind::Transient,
            PublishError::Rejected { .. } => ErrorKind::Internal,
        };
        EngineError::new(kind, err.to_string(), err.raw_error_message())
    }
}
