use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::fs::{create_context_archive, delete_file_if_exists, workspace_directory};
use crate::io_models::{Fingerprint, FunctionSpec, SourceSpec};
use crate::object_storage::{ObjectStorage, ObjectStorageError};

pub mod runtime_templates;

#[derive(Clone, Error, Debug)]
pub enum BuildContextError {
    #[error("No wrapper template for runtime `{runtime}`.")]
    TemplateMissing { runtime: String, raw_error_message: String },
    #[error("Packed source archive is {size} bytes, above the {limit} bytes limit.")]
    ArchiveTooLarge { size: u64, limit: u64 },
    #[error("Invalid source: {reason}.")]
    InvalidSource { reason: String },
    #[error("Cannot pack build context.")]
    Io { raw_error_message: String },
    #[error(transparent)]
    Storage(#[from] ObjectStorageError),
}

/// BuildContext: packed source sitting in object storage, referenced by
/// exactly one build job and expired by bucket TTL.
#[derive(Clone, Debug)]
pub struct BuildContext {
    pub context_key: String,
    pub fingerprint: Fingerprint,
    pub archive_size: u64,
    pub created_at: DateTime<Utc>,
}

/// BuildContextManager: turns a function spec into a reproducible archive in
/// object storage and the fingerprint that identifies it.
pub struct BuildContextManager {
    object_storage: Arc<dyn ObjectStorage>,
    workspace_root_dir: String,
    max_archive_bytes: u64,
}

impl BuildContextManager {
    pub fn new(object_storage: Arc<dyn ObjectStorage>, workspace_root_dir: String, max_archive_bytes: u64) -> Self {
        BuildContextManager {
            object_storage,
            workspace_root_dir,
            max_archive_bytes,
        }
    }

    /// Packs the source plus the runtime wrapper into a deterministic archive,
    /// uploads it under the canonical key and returns the context.
    pub async fn create_context(&self, spec: &FunctionSpec) -> Result<BuildContext, BuildContextError> {
        let archive_bytes = match &spec.source {
            SourceSpec::Inline { files } => self.pack_inline(spec, files)?,
            SourceSpec::ObjectStore { reference } => self.fetch_uploaded(reference).await?,
        };

        let size = archive_bytes.len() as u64;
        if size > self.max_archive_bytes {
            return Err(BuildContextError::ArchiveTooLarge {
                size,
                limit: self.max_archive_bytes,
            });
        }

        let mut hasher = Sha256::new();
        hasher.update(&archive_bytes);
        let content_digest = format!("sha256:{}", hex::encode(hasher.finalize()));

        let fingerprint = Fingerprint::new(spec, content_digest);
        let context_key = fingerprint.context_key();

        self.object_storage.put(&context_key, archive_bytes).await?;

        info!(
            "build context {} published for {}/{} ({} bytes)",
            context_key, spec.namespace, spec.function, size
        );

        Ok(BuildContext {
            context_key,
            fingerprint,
            archive_size: size,
            created_at: Utc::now(),
        })
    }

    fn pack_inline(&self, spec: &FunctionSpec, files: &BTreeMap<String, String>) -> Result<Vec<u8>, BuildContextError> {
        for path in files.keys() {
            if path.starts_with('/') || path.split('/').any(|segment| segment.is_empty() || segment == "..") {
                return Err(BuildContextError::InvalidSource {
                    reason: format!("source path `{path}` must be a clean relative path"),
                });
            }
        }

        let mut entries = files.clone();
        for (path, content) in runtime_templates::render_wrapper(&spec.runtime, &spec.handler)? {
            if entries.insert(path.clone(), content).is_some() {
                return Err(BuildContextError::InvalidSource {
                    reason: format!("source path `{path}` collides with the runtime wrapper"),
                });
            }
        }

        let io_err = |err: std::io::Error| BuildContextError::Io {
            raw_error_message: err.to_string(),
        };

        let execution_id = Uuid::new_v4().to_string();
        let dir = workspace_directory(&self.workspace_root_dir, &execution_id, "build-context").map_err(io_err)?;
        let archive_path = dir.join("context.tar.gz");

        create_context_archive(&entries, &archive_path).map_err(io_err)?;
        let bytes = std::fs::read(&archive_path).map_err(io_err)?;
        let _ = delete_file_if_exists(&archive_path);

        Ok(bytes)
    }

    /// Object-store sources were uploaded by the CLI under a caller-chosen
    /// key; re-read them so the fingerprint hashes real content, then let
    /// `create_context` republish under the canonical key.
    async fn fetch_uploaded(&self, reference: &str) -> Result<Vec<u8>, BuildContextError> {
        match self.object_storage.get(reference).await {
            Ok(bytes) => Ok(bytes),
            Err(ObjectStorageError::ObjectNotFound { key }) => Err(BuildContextError::InvalidSource {
                reason: format!("uploaded source `{key}` does not exist"),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use maplit::btreemap;
    use url::Url;

    use super::*;
    use crate::io_models::{ResourceSpec, RuntimeKind, RuntimeSpec, ScalingSpec};

    #[derive(Default)]
    struct InMemoryObjectStorage {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ObjectStorage for InMemoryObjectStorage {
        async fn put(&self, key: &str, body: Vec<u8>) -> Result<(), ObjectStorageError> {
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStorageError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or(ObjectStorageError::ObjectNotFound { key: key.to_string() })
        }

        async fn presign(&self, key: &str, _ttl: Duration) -> Result<Url, ObjectStorageError> {
            Ok(Url::parse(&format!("https://storage.test/{key}")).expect("static url"))
        }
    }

    fn fixture_spec() -> FunctionSpec {
        FunctionSpec {
            function: "hello".to_string(),
            namespace: "ns1".to_string(),
            runtime: RuntimeSpec {
                language: RuntimeKind::Python,
                version: "3.11".to_string(),
            },
            handler: "main.handler".to_string(),
            source: SourceSpec::Inline {
                files: btreemap! { "main.py".to_string() => "def handler(e): return {\"ok\": True}".to_string() },
            },
            scaling: ScalingSpec::default(),
            env: BTreeMap::new(),
            resources: ResourceSpec::default(),
        }
    }

    fn manager(storage: Arc<InMemoryObjectStorage>, max_bytes: u64) -> BuildContextManager {
        let workspace = tempfile::tempdir().expect("tempdir").keep();
        BuildContextManager::new(storage, workspace.to_string_lossy().to_string(), max_bytes)
    }

    #[tokio::test]
    async fn test_create_context_uploads_under_canonical_key() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        let manager = manager(storage.clone(), 1024 * 1024);

        let context = manager.create_context(&fixture_spec()).await.expect("create context");

        assert_eq!(context.context_key, context.fingerprint.context_key());
        assert!(context.context_key.starts_with("tmp/ns1/hello/"));
        assert!(context.archive_size > 0);
        assert!(storage.objects.lock().unwrap().contains_key(&context.context_key));
    }

    #[tokio::test]
    async fn test_same_source_same_fingerprint() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        let manager = manager(storage, 1024 * 1024);

        let first = manager.create_context(&fixture_spec()).await.expect("first");
        let second = manager.create_context(&fixture_spec()).await.expect("second");
        assert_eq!(first.fingerprint, second.fingerprint);

        let mut changed = fixture_spec();
        changed.source = SourceSpec::Inline {
            files: btreemap! { "main.py".to_string() => "def handler(e): return {}".to_string() },
        };
        let third = manager.create_context(&changed).await.expect("third");
        assert_ne!(first.fingerprint, third.fingerprint);
    }

    #[tokio::test]
    async fn test_archive_too_large_is_fatal() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        let manager = manager(storage, 16);

        let err = manager.create_context(&fixture_spec()).await.expect_err("must exceed");
        assert!(matches!(err, BuildContextError::ArchiveTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_escaping_source_path_is_rejected() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        let manager = manager(storage, 1024 * 1024);

        let mut spec = fixture_spec();
        spec.source = SourceSpec::Inline {
            files: btreemap! { "../outside.py".to_string() => "x".to_string() },
        };

        let err = manager.create_context(&spec).await.expect_err("must reject");
        assert!(matches!(err, BuildContextError::InvalidSource { .. }));
    }

    #[tokio::test]
    async fn test_object_store_source_is_republished() {
        let storage = Arc::new(InMemoryObjectStorage::default());
        storage
            .put("tmp/uploads/hello.tar", b"precooked archive".to_vec())
            .await
            .expect("seed");
        let manager = manager(storage.clone(), 1024 * 1024);

        let mut spec = fixture_spec();
        spec.source = SourceSpec::ObjectStore {
            reference: "tmp/uploads/hello.tar".to_string(),
        };

        let context = manager.create_context(&spec).await.expect("create");
        assert!(storage.objects.lock().unwrap().contains_key(&context.context_key));

        let mut missing = fixture_spec();
        missing.source = SourceSpec::ObjectStore {
            reference: "tmp/uploads/absent.tar".to_string(),
        };
        let err = manager.create_context(&missing).await.expect_err("missing upload");
        assert!(matches!(err, BuildContextError::InvalidSource { .. }));
    }
}
