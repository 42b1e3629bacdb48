use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// RuntimeKind: the closed set of supported function runtimes. Adding one is
/// a data change in the wrapper template table, not a new subclass.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Python,
    Node,
    Go,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Python => "python",
            RuntimeKind::Node => "node",
            RuntimeKind::Go => "go",
        }
    }
}

impl Display for RuntimeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub language: RuntimeKind,
    pub version: String,
}

impl Display for RuntimeSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.language, self.version)
    }
}

/// ScalingSpec: bounds for the auto-scaled HTTP endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScalingSpec {
    pub min_scale: u32,
    pub max_scale: u32,
    pub target_concurrency: u32,
}

impl Default for ScalingSpec {
    fn default() -> Self {
        ScalingSpec {
            min_scale: 0,
            max_scale: 10,
            target_concurrency: 100,
        }
    }
}

impl ScalingSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_scale < self.min_scale {
            return Err(format!(
                "max_scale ({}) must be >= min_scale ({})",
                self.max_scale, self.min_scale
            ));
        }
        if self.target_concurrency == 0 {
            return Err("target_concurrency must be > 0".to_string());
        }
        Ok(())
    }
}

/// SourceSpec: where the user code comes from. Inline sources are packed by
/// the build context manager; object-store references are consumed as-is.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SourceSpec {
    Inline {
        /// Relative path -> file content.
        files: BTreeMap<String, String>,
    },
    ObjectStore {
        #[serde(rename = "ref")]
        reference: String,
    },
}

/// Resource requests/limits for build jobs and serving pods.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ResourceSpec {
    pub cpu_request_in_milli: u32,
    pub cpu_limit_in_milli: u32,
    pub ram_request_in_mib: u32,
    pub ram_limit_in_mib: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        ResourceSpec {
            cpu_request_in_milli: 250,
            cpu_limit_in_milli: 1000,
            ram_request_in_mib: 256,
            ram_limit_in_mib: 1024,
        }
    }
}

/// FunctionSpec: the user-declared desired state of a serverless function,
/// carried in `command.build.start` payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub function: String,
    pub namespace: String,
    pub runtime: RuntimeSpec,
    pub handler: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub scaling: ScalingSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
}

impl FunctionSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.function.is_empty() {
            return Err("function name cannot be empty".to_string());
        }
        if !self
            .function
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(format!(
                "function name `{}` must be a lowercase RFC 1123 label",
                self.function
            ));
        }
        if self.namespace.is_empty() {
            return Err("namespace cannot be empty".to_string());
        }
        if self.handler.is_empty() {
            return Err("handler path cannot be empty".to_string());
        }
        if let SourceSpec::Inline { files } = &self.source {
            if files.is_empty() {
                return Err("inline source must carry at least one file".to_string());
            }
        }
        self.scaling.validate()
    }
}

/// Fingerprint: deterministic identifier for a build input. Two requests with
/// identical fingerprints collapse to a single build.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub function: String,
    pub namespace: String,
    pub runtime: RuntimeSpec,
    pub handler: String,
    pub content_digest: String,
}

impl Fingerprint {
    pub fn new(spec: &FunctionSpec, content_digest: String) -> Self {
        Fingerprint {
            function: spec.function.clone(),
            namespace: spec.namespace.clone(),
            runtime: spec.runtime.clone(),
            handler: spec.handler.clone(),
            content_digest,
        }
    }

    /// Canonical string over all identity attributes.
    pub fn canonical(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.namespace, self.function, self.runtime, self.handler, self.content_digest
        )
    }

    /// Short, label-safe form (sha256 of the canonical string, 12 hex chars).
    /// Used as the `fingerprint` label value and in derived job names.
    pub fn short(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())[..12].to_string()
    }

    /// Derived build job name, bounded to a valid RFC 1123 label.
    pub fn job_name(&self) -> String {
        let max_function_len = 63 - "build--".len() - 12;
        let function = if self.function.len() > max_function_len {
            &self.function[..max_function_len]
        } else {
            self.function.as_str()
        };
        format!("build-{}-{}", function, self.short())
    }

    /// Canonical object-storage key for the packed build context.
    pub fn context_key(&self) -> String {
        format!("tmp/{}/{}/{}.tar", self.namespace, self.function, self.short())
    }
}

/// ImageRef: registry URI plus content digest produced by a completed build.
/// The digest is empty only on the informer fallback path, where the
/// reference is already pinned by its content-derived fingerprint tag.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub uri: String,
    #[serde(default)]
    pub digest: String,
}

impl ImageRef {
    /// Pinned reference, `uri@sha256:...` (or the tagged uri when no digest
    /// was reported).
    pub fn full_ref(&self) -> String {
        if self.digest.is_empty() {
            self.uri.clone()
        } else {
            format!("{}@{}", self.uri, self.digest)
        }
    }

    /// Parses a stored reference back, splitting on the digest separator.
    pub fn parse(reference: &str) -> ImageRef {
        match reference.split_once('@') {
            Some((uri, digest)) => ImageRef {
                uri: uri.to_string(),
                digest: digest.to_string(),
            },
            None => ImageRef {
                uri: reference.to_string(),
                digest: String::new(),
            },
        }
    }
}

impl Display for ImageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_ref())
    }
}
