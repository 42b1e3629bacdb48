//! Wire payloads for command and lifecycle events. Field names follow the
//! CloudEvents JSON convention (camelCase) regardless of Rust naming.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::errors::ErrorMessageVerbosity;
use crate::io_models::{FunctionSpec, ImageRef, ScalingSpec};

/// `command.build.start` carries the full function spec; `command.build.retry`
/// reuses it unchanged.
pub type BuildStartData = FunctionSpec;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCancelData {
    pub function: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCommandData {
    pub function: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDeleteData {
    pub function: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackData {
    pub function: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStartedData {
    pub function: String,
    pub namespace: String,
    pub job_name: String,
    pub build_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCompletedData {
    pub function: String,
    pub namespace: String,
    pub job_name: String,
    pub image_uri: String,
    pub digest: String,
    /// Wall-clock build duration in milliseconds.
    pub duration: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFailedData {
    pub function: String,
    pub namespace: String,
    pub job_name: String,
    pub error: ErrorData,
    pub duration: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCancelledData {
    pub function: String,
    pub namespace: String,
    pub job_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceLifecycleData {
    pub function: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReadyData {
    pub function: String,
    pub namespace: String,
    pub url: String,
    pub image_digest: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDegradedData {
    pub function: String,
    pub namespace: String,
    pub error: ErrorData,
}

/// ErrorData: the taxonomy entry surfaced to users in `.failed` payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorData {
    fn from(err: &EngineError) -> Self {
        ErrorData {
            code: err.kind().as_str().to_string(),
            message: err.message(ErrorMessageVerbosity::SafeOnly),
            retryable: err.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_error_data_from_engine_error() {
        let err = EngineError::new(
            ErrorKind::Transient,
            "Cannot schedule build".to_string(),
            Some("connection reset".to_string()),
        );
        let data = ErrorData::from(&err);
        assert_eq!(data.code, "transient");
        assert!(data.retryable);
        // raw details never reach the wire
        assert!(!data.message.contains("connection reset"));
    }

    #[test]
    fn test_lifecycle_payload_field_casing() {
        let data = BuildCompletedData {
            function: "hello".to_string(),
            namespace: "ns1".to_string(),
            job_name: "build-hello-abc".to_string(),
            image_uri: "registry.local/hello".to_string(),
            digest: "sha256:abc".to_string(),
            duration: 4200,
        };
        let json = serde_json::to_value(&data).expect("payload should serialize");
        assert!(json.get("jobName").is_some());
        assert!(json.get("imageUri").is_some());
        assert!(json.get("job_name").is_none());
    }
}
