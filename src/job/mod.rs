use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, ResourceRequirements, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::build_context::BuildContext;
use crate::constants::{
    ANNOTATION_CORRELATION_ID, ANNOTATION_IDEMPOTENCY_KEY, ANNOTATION_SERVING_SPEC, BUILDER_CONTAINER_NAME,
    ENV_BROKER_URL, ENV_CONTEXT_URL, ENV_CORRELATION_ID, ENV_FINGERPRINT, ENV_FUNCTION_NAME, ENV_JOB_NAME,
    ENV_JOB_NAMESPACE, ENV_POD_NAME, ENV_TARGET_REGISTRY, JOB_TTL_AFTER_FINISHED_SECONDS, LABEL_FINGERPRINT,
    LABEL_FUNCTION, LABEL_MANAGED_BY, LABEL_NAMESPACE, MANAGED_BY, SIDECAR_CONTAINER_NAME, WORKSPACE_MOUNT_PATH,
    WORKSPACE_VOLUME_NAME,
};
use crate::io_models::FunctionSpec;
use crate::kube_client::{KubeAdapterError, KubernetesAdapter};
use crate::object_storage::ObjectStorage;
use crate::service::ServingSpec;

pub mod creator;

const CREATE_ATTEMPTS: usize = 3;
const DELETION_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DELETION_POLL_ATTEMPTS: usize = 100;

#[derive(Clone, Error, Debug)]
pub enum JobError {
    #[error("Namespace `{namespace}` already runs {cap} concurrent builds.")]
    ConcurrencyCapReached { namespace: String, cap: usize },
    #[error("Could not obtain job slot for `{job_name}` after repeated delete-and-create attempts.")]
    CreateConflict { job_name: String },
    #[error("Build context `{context_key}` is not available.")]
    MissingBuildContext { context_key: String },
    #[error(transparent)]
    Kube(#[from] KubeAdapterError),
}

/// The five-plus-one normalized states a build job can be observed in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl BuildJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildJobStatus::Completed | BuildJobStatus::Failed | BuildJobStatus::Timeout | BuildJobStatus::Cancelled
        )
    }
}

/// BuildJob: the normalized view of an in-cluster build job.
#[derive(Clone, Debug)]
pub struct BuildJob {
    pub name: String,
    pub namespace: String,
    pub function: String,
    pub fingerprint: String,
    pub status: BuildJobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<Uuid>,
    pub serving_spec: Option<ServingSpec>,
    pub message: Option<String>,
}

impl BuildJob {
    /// Normalizes raw Kubernetes job conditions into the closed status set.
    pub fn from_k8s_job(job: &Job) -> Option<BuildJob> {
        let metadata = &job.metadata;
        let labels = metadata.labels.clone().unwrap_or_default();
        let annotations = metadata.annotations.clone().unwrap_or_default();

        if labels.get(LABEL_MANAGED_BY).map(String::as_str) != Some(MANAGED_BY) {
            return None;
        }

        let status = normalize_status(job);
        let job_status = job.status.clone().unwrap_or_default();

        Some(BuildJob {
            name: metadata.name.clone().unwrap_or_default(),
            namespace: metadata.namespace.clone().unwrap_or_default(),
            function: labels.get(LABEL_FUNCTION).cloned().unwrap_or_default(),
            fingerprint: labels.get(LABEL_FINGERPRINT).cloned().unwrap_or_default(),
            status,
            started_at: job_status.start_time.map(|t| t.0),
            completed_at: job_status.completion_time.map(|t| t.0),
            correlation_id: annotations
                .get(ANNOTATION_CORRELATION_ID)
                .and_then(|raw| Uuid::parse_str(raw).ok()),
            serving_spec: annotations
                .get(ANNOTATION_SERVING_SPEC)
                .and_then(|raw| serde_json::from_str(raw).ok()),
            message: terminal_message(job),
        })
    }

    pub fn duration_ms(&self) -> u64 {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }
}

fn normalize_status(job: &Job) -> BuildJobStatus {
    if job.metadata.deletion_timestamp.is_some() {
        return BuildJobStatus::Cancelled;
    }

    let status = job.status.clone().unwrap_or_default();
    for condition in status.conditions.unwrap_or_default() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return BuildJobStatus::Completed,
            "Failed" => {
                return if condition.reason.as_deref() == Some("DeadlineExceeded") {
                    BuildJobStatus::Timeout
                } else {
                    BuildJobStatus::Failed
                };
            }
            _ => {}
        }
    }

    if status.active.unwrap_or(0) > 0 {
        BuildJobStatus::Running
    } else {
        BuildJobStatus::Pending
    }
}

fn terminal_message(job: &Job) -> Option<String> {
    job.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .filter(|condition| condition.status == "True")
        .find_map(|condition| condition.message.clone())
}

pub fn function_selector(function: &str) -> String {
    format!("{LABEL_FUNCTION}={function},{LABEL_MANAGED_BY}={MANAGED_BY}")
}

pub fn managed_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGED_BY}")
}

/// Deterministic dedup key shared by the sidecar publish path and the
/// informer fallback, so the two deliveries of one terminal observation
/// collapse into a single handled event.
pub fn terminal_idempotency_key(job_name: &str, status: BuildJobStatus) -> String {
    let suffix = match status {
        BuildJobStatus::Completed => "completed",
        BuildJobStatus::Failed => "failed",
        BuildJobStatus::Timeout => "timeout",
        BuildJobStatus::Cancelled => "cancelled",
        BuildJobStatus::Pending => "pending",
        BuildJobStatus::Running => "running",
    };
    format!("{job_name}:{suffix}")
}

/// A build whose job was deleted because a newer request took its place.
#[derive(Clone, Debug)]
pub struct SupersededBuild {
    pub correlation_id: Uuid,
    pub job_name: String,
    pub function: String,
    pub namespace: String,
}

/// BuildJobRequest: everything a worker needs to schedule one build.
#[derive(Clone, Debug)]
pub struct BuildJobRequest {
    pub spec: FunctionSpec,
    pub context: BuildContext,
    pub correlation_id: Uuid,
    pub idempotency_key: Option<String>,
}

/// JobManager: creates and inspects build jobs. Per-fingerprint uniqueness is
/// enforced by delete-then-create: the newest request always wins.
pub struct JobManager {
    kube: Arc<dyn KubernetesAdapter>,
    object_storage: Arc<dyn ObjectStorage>,
    builder_image: String,
    sidecar_image: String,
    registry_url: String,
    broker_url: String,
    build_timeout: Duration,
    presign_ttl: Duration,
    max_concurrent_builds_per_namespace: usize,
    /// Serializes delete-then-create per function so two workers cannot
    /// interleave their sweeps.
    creation_locks: std::sync::Mutex<std::collections::HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kube: Arc<dyn KubernetesAdapter>,
        object_storage: Arc<dyn ObjectStorage>,
        builder_image: String,
        sidecar_image: String,
        registry_url: String,
        broker_url: String,
        build_timeout: Duration,
        presign_ttl: Duration,
        max_concurrent_builds_per_namespace: usize,
    ) -> Self {
        JobManager {
            kube,
            object_storage,
            builder_image,
            sidecar_image,
            registry_url,
            broker_url,
            build_timeout,
            presign_ttl,
            max_concurrent_builds_per_namespace,
            creation_locks: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn creation_lock(&self, namespace: &str, function: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.creation_locks.lock().expect("creation locks poisoned");
        locks
            .entry(format!("{namespace}/{function}"))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Schedules the build job for a request. Any prior build job of the same
    /// function is deleted first (the newest request strictly wins, which also
    /// keeps the at-most-one-per-fingerprint invariant). Returns the
    /// normalized view of the created job plus the superseded builds, whose
    /// chains get `.build.cancelled`.
    pub async fn create_job(&self, request: &BuildJobRequest) -> Result<(BuildJob, Vec<SupersededBuild>), JobError> {
        if request.context.context_key.is_empty() {
            return Err(JobError::MissingBuildContext {
                context_key: request.context.context_key.clone(),
            });
        }

        let namespace = &request.spec.namespace;
        let fingerprint = &request.context.fingerprint;
        let job_name = fingerprint.job_name();
        let selector = function_selector(&request.spec.function);

        let lock = self.creation_lock(namespace, &request.spec.function);
        let _guard = lock.lock().await;

        self.enforce_namespace_cap(namespace, &selector).await?;

        let context_url = self
            .object_storage
            .presign(&request.context.context_key, self.presign_ttl)
            .await
            .map_err(|err| {
                warn!("cannot presign build context {}: {}", request.context.context_key, err);
                JobError::MissingBuildContext {
                    context_key: request.context.context_key.clone(),
                }
            })?;

        let mut superseded = Vec::new();

        for attempt in 0..CREATE_ATTEMPTS {
            for existing in self.kube.list_jobs(namespace, &selector).await? {
                if let Some(previous) = BuildJob::from_k8s_job(&existing) {
                    if let Some(correlation_id) = previous.correlation_id {
                        if correlation_id != request.correlation_id && !previous.status.is_terminal() {
                            superseded.push(SupersededBuild {
                                correlation_id,
                                job_name: previous.name.clone(),
                                function: previous.function.clone(),
                                namespace: previous.namespace.clone(),
                            });
                        }
                    }
                    self.delete_and_observe(namespace, &previous.name).await?;
                }
            }

            let job = self.compose_job(request, &job_name, context_url.as_str());
            match self.kube.create_job(namespace, job).await {
                Ok(created) => {
                    info!("build job {}/{} created (attempt {})", namespace, job_name, attempt + 1);
                    let build_job = BuildJob::from_k8s_job(&created).unwrap_or(BuildJob {
                        name: job_name.clone(),
                        namespace: namespace.clone(),
                        function: request.spec.function.clone(),
                        fingerprint: fingerprint.short(),
                        status: BuildJobStatus::Pending,
                        started_at: None,
                        completed_at: None,
                        correlation_id: Some(request.correlation_id),
                        serving_spec: Some(ServingSpec::from(&request.spec)),
                        message: None,
                    });
                    return Ok((build_job, superseded));
                }
                Err(KubeAdapterError::AlreadyExists { .. }) => {
                    // Someone re-created it between our delete and create; take
                    // the delete-first path again, bounded.
                    warn!("job {}/{} reappeared, deleting again", namespace, job_name);
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(JobError::CreateConflict { job_name })
    }

    pub async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<BuildJob>, JobError> {
        Ok(self
            .kube
            .get_job(namespace, name)
            .await?
            .as_ref()
            .and_then(BuildJob::from_k8s_job))
    }

    pub async fn list_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<BuildJob>, JobError> {
        Ok(self
            .kube
            .list_jobs(namespace, selector)
            .await?
            .iter()
            .filter_map(BuildJob::from_k8s_job)
            .collect())
    }

    /// Deletes every non-terminal job matching the function, for
    /// `command.build.cancel`. Returns the cancelled jobs.
    pub async fn cancel_jobs(&self, function: &str, namespace: &str) -> Result<Vec<BuildJob>, JobError> {
        let selector = format!("{LABEL_FUNCTION}={function},{}", managed_selector());
        let mut cancelled = Vec::new();

        for job in self.kube.list_jobs(namespace, &selector).await? {
            if let Some(build_job) = BuildJob::from_k8s_job(&job) {
                if build_job.status.is_terminal() {
                    continue;
                }
                self.delete_and_observe(namespace, &build_job.name).await?;
                cancelled.push(build_job);
            }
        }

        Ok(cancelled)
    }

    async fn enforce_namespace_cap(&self, namespace: &str, supersede_selector: &str) -> Result<(), JobError> {
        // A request that supersedes a job of its own function never counts
        // against the cap: it frees a slot before taking one.
        let same_function = self.kube.list_jobs(namespace, supersede_selector).await?;
        if !same_function.is_empty() {
            return Ok(());
        }

        let running = self
            .kube
            .list_jobs(namespace, &managed_selector())
            .await?
            .iter()
            .filter_map(BuildJob::from_k8s_job)
            .filter(|job| !job.status.is_terminal())
            .count();

        if running >= self.max_concurrent_builds_per_namespace {
            return Err(JobError::ConcurrencyCapReached {
                namespace: namespace.to_string(),
                cap: self.max_concurrent_builds_per_namespace,
            });
        }

        Ok(())
    }

    async fn delete_and_observe(&self, namespace: &str, name: &str) -> Result<(), JobError> {
        match self.kube.delete_job(namespace, name).await {
            Ok(()) => {}
            Err(KubeAdapterError::NotFound { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        for _ in 0..DELETION_POLL_ATTEMPTS {
            if self.kube.get_job(namespace, name).await?.is_none() {
                return Ok(());
            }
            tokio::time::sleep(DELETION_POLL_INTERVAL).await;
        }

        Err(JobError::CreateConflict {
            job_name: name.to_string(),
        })
    }

    fn compose_job(&self, request: &BuildJobRequest, job_name: &str, context_url: &str) -> Job {
        let spec = &request.spec;
        let fingerprint_short = request.context.fingerprint.short();
        let target_image = format!("{}/{}/{}", self.registry_url, spec.namespace, spec.function);

        let labels = BTreeMap::from([
            (LABEL_FUNCTION.to_string(), spec.function.clone()),
            (LABEL_NAMESPACE.to_string(), spec.namespace.clone()),
            (LABEL_FINGERPRINT.to_string(), fingerprint_short.clone()),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        ]);

        let mut annotations = BTreeMap::from([
            (ANNOTATION_CORRELATION_ID.to_string(), request.correlation_id.to_string()),
            (
                ANNOTATION_SERVING_SPEC.to_string(),
                serde_json::to_string(&ServingSpec::from(spec)).unwrap_or_default(),
            ),
        ]);
        if let Some(key) = &request.idempotency_key {
            annotations.insert(ANNOTATION_IDEMPOTENCY_KEY.to_string(), key.clone());
        }

        let env = |key: &str, value: String| EnvVar {
            name: key.to_string(),
            value: Some(value),
            ..Default::default()
        };

        let builder = Container {
            name: BUILDER_CONTAINER_NAME.to_string(),
            image: Some(self.builder_image.clone()),
            env: Some(vec![
                env(ENV_CONTEXT_URL, context_url.to_string()),
                env(ENV_TARGET_REGISTRY, target_image.clone()),
                env(ENV_FINGERPRINT, fingerprint_short.clone()),
                env(ENV_CORRELATION_ID, request.correlation_id.to_string()),
            ]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(format!("{}m", spec.resources.cpu_request_in_milli))),
                    ("memory".to_string(), Quantity(format!("{}Mi", spec.resources.ram_request_in_mib))),
                ])),
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(format!("{}m", spec.resources.cpu_limit_in_milli))),
                    ("memory".to_string(), Quantity(format!("{}Mi", spec.resources.ram_limit_in_mib))),
                ])),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: WORKSPACE_VOLUME_NAME.to_string(),
                mount_path: WORKSPACE_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let sidecar = Container {
            name: SIDECAR_CONTAINER_NAME.to_string(),
            image: Some(self.sidecar_image.clone()),
            env: Some(vec![
                env(ENV_JOB_NAME, job_name.to_string()),
                env(ENV_JOB_NAMESPACE, spec.namespace.clone()),
                env(ENV_FUNCTION_NAME, spec.function.clone()),
                env(ENV_FINGERPRINT, fingerprint_short.clone()),
                env(ENV_CORRELATION_ID, request.correlation_id.to_string()),
                env(ENV_BROKER_URL, self.broker_url.clone()),
                EnvVar {
                    name: ENV_POD_NAME.to_string(),
                    value_from: Some(EnvVarSource {
                        field_ref: Some(ObjectFieldSelector {
                            field_path: "metadata.name".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: WORKSPACE_VOLUME_NAME.to_string(),
                mount_path: WORKSPACE_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Job {
            metadata: ObjectMeta {
                name: Some(job_name.to_string()),
                namespace: Some(spec.namespace.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(JobSpec {
                ttl_seconds_after_finished: Some(JOB_TTL_AFTER_FINISHED_SECONDS),
                backoff_limit: Some(0),
                active_deadline_seconds: Some(self.build_timeout.as_secs() as i64),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![builder, sidecar],
                        volumes: Some(vec![Volume {
                            name: WORKSPACE_VOLUME_NAME.to_string(),
                            empty_dir: Some(Default::default()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn job_with_conditions(conditions: Vec<JobCondition>, active: Option<i32>) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some("build-hello-abc".to_string()),
                namespace: Some("ns1".to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_FUNCTION.to_string(), "hello".to_string()),
                    (LABEL_NAMESPACE.to_string(), "ns1".to_string()),
                    (LABEL_FINGERPRINT.to_string(), "abc123def456".to_string()),
                    (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
                ])),
                ..Default::default()
            },
            spec: None,
            status: Some(JobStatus {
                conditions: Some(conditions),
                active,
                start_time: Some(Time(chrono::Utc::now())),
                ..Default::default()
            }),
        }
    }

    fn condition(type_: &str, reason: Option<&str>) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: reason.map(str::to_string),
            message: Some("builder exited".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_normalization() {
        struct TestCase {
            conditions: Vec<JobCondition>,
            active: Option<i32>,
            expected: BuildJobStatus,
            description: &'static str,
        }

        let test_cases = vec![
            TestCase {
                conditions: vec![condition("Complete", None)],
                active: None,
                expected: BuildJobStatus::Completed,
                description: "complete condition",
            },
            TestCase {
                conditions: vec![condition("Failed", Some("BackoffLimitExceeded"))],
                active: None,
                expected: BuildJobStatus::Failed,
                description: "failed condition",
            },
            TestCase {
                conditions: vec![condition("Failed", Some("DeadlineExceeded"))],
                active: None,
                expected: BuildJobStatus::Timeout,
                description: "deadline exceeded maps to timeout",
            },
            TestCase {
                conditions: vec![],
                active: Some(1),
                expected: BuildJobStatus::Running,
                description: "active pods mean running",
            },
            TestCase {
                conditions: vec![],
                active: None,
                expected: BuildJobStatus::Pending,
                description: "no condition and no pod means pending",
            },
        ];

        for tc in test_cases {
            let job = job_with_conditions(tc.conditions, tc.active);
            let build_job = BuildJob::from_k8s_job(&job).expect("managed job");
            assert_eq!(build_job.status, tc.expected, "{}", tc.description);
        }
    }

    #[test]
    fn test_foreign_jobs_are_ignored() {
        let mut job = job_with_conditions(vec![], None);
        job.metadata.labels = Some(BTreeMap::from([("app".to_string(), "unrelated".to_string())]));
        assert!(BuildJob::from_k8s_job(&job).is_none());
    }

    #[test]
    fn test_deletion_timestamp_means_cancelled() {
        let mut job = job_with_conditions(vec![], Some(1));
        job.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let build_job = BuildJob::from_k8s_job(&job).expect("managed job");
        assert_eq!(build_job.status, BuildJobStatus::Cancelled);
    }

    mod composition {
        use super::*;
        use crate::build_context::BuildContext;
        use crate::io_models::{
            Fingerprint, ResourceSpec, RuntimeKind, RuntimeSpec, ScalingSpec, SourceSpec,
        };
        use maplit::btreemap;
        use std::sync::Arc;

        struct DenyAllStorage;

        #[async_trait::async_trait]
        impl crate::object_storage::ObjectStorage for DenyAllStorage {
            async fn put(&self, key: &str, _body: Vec<u8>) -> Result<(), crate::object_storage::ObjectStorageError> {
                Err(crate::object_storage::ObjectStorageError::StorageUnavailable {
                    key: key.to_string(),
                    raw_error_message: "test".to_string(),
                })
            }

            async fn get(&self, key: &str) -> Result<Vec<u8>, crate::object_storage::ObjectStorageError> {
                Err(crate::object_storage::ObjectStorageError::ObjectNotFound { key: key.to_string() })
            }

            async fn presign(
                &self,
                key: &str,
                _ttl: Duration,
            ) -> Result<url::Url, crate::object_storage::ObjectStorageError> {
                Ok(url::Url::parse(&format!("https://storage.test/{key}")).expect("static url"))
            }
        }

        fn manager() -> JobManager {
            JobManager::new(
                Arc::new(crate::job::tests_support::NoopKube),
                Arc::new(DenyAllStorage),
                "builder:latest".to_string(),
                "sidecar:latest".to_string(),
                "registry.local:5000".to_string(),
                "http://broker.test".to_string(),
                Duration::from_secs(1800),
                Duration::from_secs(3600),
                10,
            )
        }

        fn request() -> BuildJobRequest {
            let spec = FunctionSpec {
                function: "hello".to_string(),
                namespace: "ns1".to_string(),
                runtime: RuntimeSpec {
                    language: RuntimeKind::Python,
                    version: "3.11".to_string(),
                },
                handler: "main.handler".to_string(),
                source: SourceSpec::Inline {
                    files: btreemap! { "main.py".to_string() => "x".to_string() },
                },
                scaling: ScalingSpec::default(),
                env: Default::default(),
                resources: ResourceSpec::default(),
            };
            let fingerprint = Fingerprint::new(&spec, "sha256:abc".to_string());
            BuildJobRequest {
                context: BuildContext {
                    context_key: fingerprint.context_key(),
                    fingerprint,
                    archive_size: 64,
                    created_at: chrono::Utc::now(),
                },
                spec,
                correlation_id: Uuid::new_v4(),
                idempotency_key: Some("idem-1".to_string()),
            }
        }

        #[test]
        fn test_job_spec_contract() {
            let manager = manager();
            let request = request();
            let job = manager.compose_job(&request, &request.context.fingerprint.job_name(), "https://ctx.test/a.tar");

            let labels = job.metadata.labels.as_ref().expect("labels");
            assert_eq!(labels.get(LABEL_FUNCTION).map(String::as_str), Some("hello"));
            assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(MANAGED_BY));

            let annotations = job.metadata.annotations.as_ref().expect("annotations");
            assert!(annotations.contains_key(ANNOTATION_CORRELATION_ID));
            assert!(annotations.contains_key(ANNOTATION_IDEMPOTENCY_KEY));
            assert!(annotations.contains_key(ANNOTATION_SERVING_SPEC));

            let spec = job.spec.as_ref().expect("job spec");
            assert_eq!(spec.ttl_seconds_after_finished, Some(JOB_TTL_AFTER_FINISHED_SECONDS));
            assert_eq!(spec.backoff_limit, Some(0));
            assert_eq!(spec.active_deadline_seconds, Some(1800));

            let pod = spec.template.spec.as_ref().expect("pod spec");
            assert_eq!(pod.containers.len(), 2);
            assert_eq!(pod.containers[0].name, BUILDER_CONTAINER_NAME);
            assert_eq!(pod.containers[1].name, SIDECAR_CONTAINER_NAME);

            let builder_env = pod.containers[0].env.as_ref().expect("builder env");
            assert!(
                builder_env
                    .iter()
                    .any(|var| var.name == ENV_CONTEXT_URL && var.value.as_deref() == Some("https://ctx.test/a.tar"))
            );
        }
    }
}
