//! Hand-written fakes and wiring helpers shared by the scenario tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use url::Url;
use uuid::Uuid;

use lambda_engine::build_context::BuildContextManager;
use lambda_engine::config::{EngineConfig, RetryPolicy};
use lambda_engine::events::io::BuildCompletedData;
use lambda_engine::events::{CloudEvent, CommandKind, EventType, LifecycleKind};
use lambda_engine::io_models::{FunctionSpec, RuntimeKind, RuntimeSpec, ScalingSpec, SourceSpec};
use lambda_engine::job::creator::AsyncJobCreator;
use lambda_engine::job::{JobManager, terminal_idempotency_key};
use lambda_engine::job::BuildJobStatus;
use lambda_engine::kube_client::{KubeAdapterError, KubernetesAdapter};
use lambda_engine::metrics_registry::StdMetricsRecorder;
use lambda_engine::msg_publisher::InMemoryEventPublisher;
use lambda_engine::object_storage::{ObjectStorage, ObjectStorageError};
use lambda_engine::orchestrator::Orchestrator;
use lambda_engine::service::{AutoScaledService, ServiceManager, Subscription};

fn selector_matches(selector: &str, labels: &Option<BTreeMap<String, String>>) -> bool {
    let labels = labels.clone().unwrap_or_default();
    selector.split(',').all(|pair| match pair.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => false,
    })
}

/// In-memory Kubernetes adapter with optional fault injection.
#[derive(Default)]
pub struct FakeKube {
    jobs: Mutex<HashMap<(String, String), Job>>,
    services: Mutex<HashMap<(String, String), AutoScaledService>>,
    subscriptions: Mutex<HashMap<(String, String), Subscription>>,
    pub job_creates: AtomicUsize,
    pub service_writes: AtomicUsize,
    pub subscription_writes: AtomicUsize,
    pub deletes: AtomicUsize,
    /// Number of upcoming service writes to fail with `Conflict`.
    pub fail_service_writes: AtomicUsize,
}

impl FakeKube {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<AutoScaledService> {
        self.services
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn subscription(&self, namespace: &str, name: &str) -> Option<Subscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Marks a stored job as terminal, the way the cluster would.
    pub fn finish_job(&self, namespace: &str, name: &str, status: BuildJobStatus) {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .expect("job to finish must exist");

        let (type_, reason) = match status {
            BuildJobStatus::Completed => ("Complete", None),
            BuildJobStatus::Timeout => ("Failed", Some("DeadlineExceeded")),
            _ => ("Failed", Some("BackoffLimitExceeded")),
        };

        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: type_.to_string(),
                status: "True".to_string(),
                reason: reason.map(str::to_string),
                ..Default::default()
            }]),
            start_time: Some(Time(chrono::Utc::now())),
            completion_time: Some(Time(chrono::Utc::now())),
            ..Default::default()
        });
    }

    fn take_service_fault(&self) -> bool {
        self.fail_service_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KubernetesAdapter for FakeKube {
    async fn create_job(&self, namespace: &str, mut job: Job) -> Result<Job, KubeAdapterError> {
        let name = job.metadata.name.clone().unwrap_or_default();
        let mut jobs = self.jobs.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if jobs.contains_key(&key) {
            return Err(KubeAdapterError::AlreadyExists {
                kind: "Job".to_string(),
                name,
            });
        }
        job.metadata.resource_version = Some("1".to_string());
        jobs.insert(key, job.clone());
        self.job_creates.fetch_add(1, Ordering::SeqCst);
        Ok(job)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError> {
        let removed = self
            .jobs
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(KubeAdapterError::NotFound {
                kind: "Job".to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, KubeAdapterError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, KubeAdapterError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), job)| ns == namespace && selector_matches(label_selector, &job.metadata.labels))
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn list_jobs_all(&self, label_selector: &str) -> Result<Vec<Job>, KubeAdapterError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| selector_matches(label_selector, &job.metadata.labels))
            .cloned()
            .collect())
    }

    async fn create_service(
        &self,
        namespace: &str,
        mut service: AutoScaledService,
    ) -> Result<AutoScaledService, KubeAdapterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        if self.take_service_fault() {
            return Err(KubeAdapterError::Conflict {
                kind: "AutoScaledService".to_string(),
                name,
                raw_error_message: "injected conflict".to_string(),
            });
        }
        let mut services = self.services.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if services.contains_key(&key) {
            return Err(KubeAdapterError::AlreadyExists {
                kind: "AutoScaledService".to_string(),
                name,
            });
        }
        service.metadata.resource_version = Some("1".to_string());
        services.insert(key, service.clone());
        self.service_writes.fetch_add(1, Ordering::SeqCst);
        Ok(service)
    }

    async fn update_service(
        &self,
        namespace: &str,
        mut service: AutoScaledService,
    ) -> Result<AutoScaledService, KubeAdapterError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        if self.take_service_fault() {
            return Err(KubeAdapterError::Conflict {
                kind: "AutoScaledService".to_string(),
                name,
                raw_error_message: "injected conflict".to_string(),
            });
        }
        let mut services = self.services.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        let current = services.get(&key).ok_or(KubeAdapterError::NotFound {
            kind: "AutoScaledService".to_string(),
            name: name.clone(),
        })?;
        if current.metadata.resource_version != service.metadata.resource_version {
            return Err(KubeAdapterError::Conflict {
                kind: "AutoScaledService".to_string(),
                name,
                raw_error_message: "stale resourceVersion".to_string(),
            });
        }
        let next_version = current
            .metadata
            .resource_version
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(1)
            + 1;
        service.metadata.resource_version = Some(next_version.to_string());
        services.insert(key, service.clone());
        self.service_writes.fetch_add(1, Ordering::SeqCst);
        Ok(service)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<AutoScaledService>, KubeAdapterError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError> {
        let removed = self
            .services
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(KubeAdapterError::NotFound {
                kind: "AutoScaledService".to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn create_subscription(
        &self,
        namespace: &str,
        mut subscription: Subscription,
    ) -> Result<Subscription, KubeAdapterError> {
        let name = subscription.metadata.name.clone().unwrap_or_default();
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let key = (namespace.to_string(), name.clone());
        if subscriptions.contains_key(&key) {
            return Err(KubeAdapterError::AlreadyExists {
                kind: "Subscription".to_string(),
                name,
            });
        }
        subscription.metadata.resource_version = Some("1".to_string());
        subscriptions.insert(key, subscription.clone());
        self.subscription_writes.fetch_add(1, Ordering::SeqCst);
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        namespace: &str,
        subscription: Subscription,
    ) -> Result<Subscription, KubeAdapterError> {
        let name = subscription.metadata.name.clone().unwrap_or_default();
        self.subscriptions
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name), subscription.clone());
        self.subscription_writes.fetch_add(1, Ordering::SeqCst);
        Ok(subscription)
    }

    async fn get_subscription(&self, namespace: &str, name: &str) -> Result<Option<Subscription>, KubeAdapterError> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn delete_subscription(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError> {
        let removed = self
            .subscriptions
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(_) => {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(KubeAdapterError::NotFound {
                kind: "Subscription".to_string(),
                name: name.to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct InMemoryObjectStorage {
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

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub creator: Arc<AsyncJobCreator>,
    pub kube: Arc<FakeKube>,
    pub publisher: Arc<InMemoryEventPublisher>,
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.queue_capacity = 8;
    config.worker_count = 4;
    config.jobs_per_second = 1000;
    // keep conflict-retry sleeps out of test wall-clock
    config.retry = RetryPolicy {
        base: Duration::from_millis(1),
        factor: 2,
        cap: Duration::from_millis(5),
        jitter_ratio: 0.0,
        max_attempts: 5,
    };
    config
}

/// Wires a full orchestrator over the fakes.
pub fn harness_with(config: EngineConfig, worker_count: usize) -> Harness {
    let kube = FakeKube::new();
    let publisher = Arc::new(InMemoryEventPublisher::new());
    let storage = Arc::new(InMemoryObjectStorage::default());
    let metrics = Arc::new(StdMetricsRecorder::new());

    let workspace = tempfile::tempdir().expect("tempdir").keep();
    let build_context = BuildContextManager::new(
        storage.clone(),
        workspace.to_string_lossy().to_string(),
        config.max_archive_bytes,
    );

    let job_manager = Arc::new(JobManager::new(
        kube.clone(),
        storage.clone(),
        "builder:latest".to_string(),
        "sidecar:latest".to_string(),
        "registry.local:5000".to_string(),
        "http://broker.test".to_string(),
        config.build_timeout,
        config.presign_ttl,
        config.max_concurrent_builds_per_namespace,
    ));

    let creator = AsyncJobCreator::start(
        job_manager.clone(),
        config.queue_capacity,
        worker_count,
        config.jobs_per_second,
        config.slot_retention,
    );

    let service_manager = ServiceManager::new(
        kube.clone(),
        "default".to_string(),
        vec!["io.knative.lambda.invoke".to_string()],
        config.retry.clone(),
    );

    let orchestrator = Orchestrator::new(
        config,
        publisher.clone(),
        metrics,
        build_context,
        job_manager,
        creator.clone(),
        service_manager,
    );

    Harness {
        orchestrator,
        creator,
        kube,
        publisher,
    }
}

pub fn harness() -> Harness {
    let config = test_config();
    let workers = config.worker_count;
    harness_with(config, workers)
}

pub fn function_spec(function: &str, source: &str) -> FunctionSpec {
    FunctionSpec {
        function: function.to_string(),
        namespace: "ns1".to_string(),
        runtime: RuntimeSpec {
            language: RuntimeKind::Python,
            version: "3.11".to_string(),
        },
        handler: "main.handler".to_string(),
        source: SourceSpec::Inline {
            files: BTreeMap::from([("main.py".to_string(), source.to_string())]),
        },
        scaling: ScalingSpec::default(),
        env: BTreeMap::new(),
        resources: Default::default(),
    }
}

pub fn command_event(
    kind: CommandKind,
    data: serde_json::Value,
    correlation_id: Uuid,
    idempotency_key: Option<&str>,
) -> CloudEvent {
    let mut event = CloudEvent::new_emitted(
        EventType::Command(kind),
        None,
        data,
        correlation_id,
        None,
        idempotency_key.map(str::to_string),
    );
    event.source = "test-cli".to_string();
    event
}

pub fn build_start_event(function: &str, source: &str, correlation_id: Uuid, idempotency_key: Option<&str>) -> CloudEvent {
    command_event(
        CommandKind::BuildStart,
        serde_json::to_value(function_spec(function, source)).expect("spec serializes"),
        correlation_id,
        idempotency_key,
    )
}

/// What the sidecar would publish after a successful build.
pub fn sidecar_completed_event(function: &str, job_name: &str, correlation_id: Uuid) -> CloudEvent {
    let data = BuildCompletedData {
        function: function.to_string(),
        namespace: "ns1".to_string(),
        job_name: job_name.to_string(),
        image_uri: format!("registry.local:5000/ns1/{function}"),
        digest: "sha256:deadbeef".to_string(),
        duration: 4200,
    };
    CloudEvent::new_emitted(
        EventType::Lifecycle(LifecycleKind::BuildCompleted),
        Some(format!("ns1/{function}")),
        serde_json::to_value(data).expect("payload serializes"),
        correlation_id,
        None,
        Some(terminal_idempotency_key(job_name, BuildJobStatus::Completed)),
    )
}

/// Polls until the condition holds or the deadline passes.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {what}");
}
