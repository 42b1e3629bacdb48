use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::build_context::BuildContextManager;
use crate::config::EngineConfig;
use crate::errors::{EngineError, ErrorKind};
use crate::events::io::{
    BuildCancelData, BuildCancelledData, BuildCompletedData, BuildFailedData, BuildStartData, BuildStartedData,
    ErrorData, FunctionDegradedData, RollbackData, ServiceCommandData, ServiceDeleteData, ServiceLifecycleData,
    ServiceReadyData,
};
use crate::events::{CloudEvent, CommandKind, EventType, LifecycleKind};
use crate::io_models::{FunctionSpec, ImageRef};
use crate::job::creator::AsyncJobCreator;
use crate::job::{BuildJobRequest, JobManager};
use crate::metrics_registry::{CounterEvent, MetricsRecorder, Phase};
use crate::msg_publisher::EventPublisher;
use crate::service::{ServiceManager, ServiceOutcome, ServingSpec};
use crate::utilities::to_short_id;

pub mod reconcile;

/// How a handled command is reported back to the ingress caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyOutcome {
    /// Work was enqueued; lifecycle events follow on the correlation id.
    Accepted,
    /// The operation finished synchronously.
    Completed,
}

/// CommandReply: the structured body returned over HTTP for every event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandReply {
    pub outcome: ReplyOutcome,
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandReply {
    fn accepted(correlation_id: Uuid) -> Self {
        CommandReply {
            outcome: ReplyOutcome::Accepted,
            correlation_id,
            build_id: None,
            job_name: None,
            message: None,
        }
    }

    fn completed(correlation_id: Uuid) -> Self {
        CommandReply {
            outcome: ReplyOutcome::Completed,
            correlation_id,
            build_id: None,
            job_name: None,
            message: None,
        }
    }

    fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }
}

type StoredOutcome = Result<CommandReply, EngineError>;

type CorrelationLock = Arc<tokio::sync::Mutex<()>>;

/// Orchestrator: routes every inbound CloudEvent to the right component and
/// emits the lifecycle events that close each causal chain.
///
/// Concurrency contract: events sharing a correlation id are serialized on a
/// per-correlation lock; unrelated correlations run concurrently. Commands
/// run under the configured deadline; lifecycle notifications do not.
pub struct Orchestrator {
    config: EngineConfig,
    publisher: Arc<dyn EventPublisher>,
    metrics: Arc<dyn MetricsRecorder>,
    build_context: BuildContextManager,
    job_manager: Arc<JobManager>,
    creator: Arc<AsyncJobCreator>,
    service_manager: ServiceManager,
    idempotency: Mutex<LruCache<String, StoredOutcome>>,
    inflight: Vec<Mutex<LruCache<Uuid, CorrelationLock>>>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        publisher: Arc<dyn EventPublisher>,
        metrics: Arc<dyn MetricsRecorder>,
        build_context: BuildContextManager,
        job_manager: Arc<JobManager>,
        creator: Arc<AsyncJobCreator>,
        service_manager: ServiceManager,
    ) -> Arc<Self> {
        let lru_size = NonZeroUsize::new(config.idempotency_lru_size).unwrap_or(NonZeroUsize::MIN);
        let locks_per_shard = NonZeroUsize::new(config.correlation_locks_per_shard).unwrap_or(NonZeroUsize::MIN);
        let inflight = (0..config.correlation_lock_shards.max(1))
            .map(|_| Mutex::new(LruCache::new(locks_per_shard)))
            .collect();

        Arc::new(Orchestrator {
            config,
            publisher,
            metrics,
            build_context,
            job_manager,
            creator,
            service_manager,
            idempotency: Mutex::new(LruCache::new(lru_size)),
            inflight,
        })
    }

    /// Entry point for every inbound event. `sync` selects the diagnostic
    /// wait-for-outcome path on build commands.
    pub async fn handle(self: &Arc<Self>, event: CloudEvent, sync: bool) -> Result<CommandReply, EngineError> {
        if let Err(reason) = event.validate() {
            self.metrics.inc(CounterEvent::CommandReceived);
            self.metrics.inc(CounterEvent::CommandRejected);
            return Err(EngineError::new_from_safe(ErrorKind::Validation, reason));
        }

        let Some(event_type) = event.parsed_type() else {
            self.metrics.inc(CounterEvent::CommandReceived);
            self.metrics.inc(CounterEvent::CommandRejected);
            return Err(EngineError::new_from_safe(
                ErrorKind::Validation,
                format!("unknown event type `{}`", event.event_type),
            ));
        };

        if matches!(event_type, EventType::Command(_)) {
            self.metrics.inc(CounterEvent::CommandReceived);
        }

        let correlation_id = event.correlationid.unwrap_or_else(Uuid::new_v4);

        // Duplicate suppression: both for duplicate commands and for the
        // sidecar/informer dual delivery of lifecycle notifications.
        if let Some(key) = event.idempotencykey.clone() {
            if let Some(prior) = self.idempotency_get(&key) {
                debug!("duplicate event for idempotency key {}, replaying prior outcome", key);
                return prior;
            }
        }

        let lock = self.correlation_lock(correlation_id);
        let _guard = lock.lock().await;

        // Re-check under the lock: a racing duplicate may have resolved while
        // this one waited its turn.
        if let Some(key) = event.idempotencykey.clone() {
            if let Some(prior) = self.idempotency_get(&key) {
                return prior;
            }
        }

        let started = Instant::now();
        let outcome = match event_type {
            EventType::Command(kind) => {
                let deadline = self.config.command_deadline;
                match tokio::time::timeout(deadline, self.dispatch_command(kind, &event, correlation_id, sync)).await
                {
                    Ok(result) => result,
                    // In-flight creator work is not cancelled; its eventual
                    // outcome still reaches the slot and the event stream.
                    Err(_) => Err(EngineError::new_timeout(&format!("handling {}", event.event_type))),
                }
            }
            EventType::Lifecycle(kind) => self.dispatch_lifecycle(kind, &event, correlation_id).await,
        };

        match (&outcome, event_type) {
            (Ok(_), EventType::Command(_)) => self.metrics.inc(CounterEvent::CommandAccepted),
            (Err(_), EventType::Command(_)) => self.metrics.inc(CounterEvent::CommandRejected),
            _ => {}
        }
        self.metrics
            .observe_phase(Phase::Receive, None, started.elapsed(), Some(correlation_id));

        if let Some(key) = event.idempotencykey.clone() {
            self.idempotency_put(key, outcome.clone());
        }

        outcome
    }

    async fn dispatch_command(
        self: &Arc<Self>,
        kind: CommandKind,
        event: &CloudEvent,
        correlation_id: Uuid,
        sync: bool,
    ) -> Result<CommandReply, EngineError> {
        match kind {
            CommandKind::BuildStart | CommandKind::BuildRetry | CommandKind::FunctionDeploy => {
                let spec: BuildStartData = parse_data(event)?;
                self.start_build(spec, event, correlation_id, sync).await
            }
            CommandKind::BuildCancel => {
                let data: BuildCancelData = parse_data(event)?;
                self.cancel_builds(data, event, correlation_id).await
            }
            CommandKind::ServiceCreate | CommandKind::ServiceUpdate => {
                let data: ServiceCommandData = parse_data(event)?;
                self.apply_service(data, event, correlation_id).await
            }
            CommandKind::ServiceDelete => {
                let data: ServiceDeleteData = parse_data(event)?;
                self.remove_service(data, event, correlation_id).await
            }
            CommandKind::FunctionRollback => {
                let data: RollbackData = parse_data(event)?;
                self.rollback_function(data, event, correlation_id).await
            }
        }
    }

    async fn dispatch_lifecycle(
        self: &Arc<Self>,
        kind: LifecycleKind,
        event: &CloudEvent,
        correlation_id: Uuid,
    ) -> Result<CommandReply, EngineError> {
        match kind {
            LifecycleKind::BuildCompleted => {
                let data: BuildCompletedData = parse_data(event)?;
                self.on_build_completed(data, event, correlation_id).await
            }
            LifecycleKind::BuildFailed | LifecycleKind::BuildTimeout => {
                let data: BuildFailedData = parse_data(event)?;
                self.on_build_failed(data, event, correlation_id).await
            }
            // Everything else is an echo of our own emissions (or a cancel
            // observed by the informer); nothing left to do for the chain.
            _ => Ok(CommandReply::completed(correlation_id)),
        }
    }

    // command.build.start / .retry / function.deploy

    async fn start_build(
        self: &Arc<Self>,
        spec: FunctionSpec,
        event: &CloudEvent,
        correlation_id: Uuid,
        sync: bool,
    ) -> Result<CommandReply, EngineError> {
        if let Err(reason) = spec.validate() {
            return Err(EngineError::new_from_safe(ErrorKind::Validation, reason));
        }

        let context = self.build_context.create_context(&spec).await.map_err(EngineError::from)?;
        let job_name = context.fingerprint.job_name();
        let build_id = Uuid::new_v4();

        let request = BuildJobRequest {
            spec: spec.clone(),
            context,
            correlation_id,
            idempotency_key: event.idempotencykey.clone(),
        };
        self.creator.submit(request)?;

        info!(
            "build {} enqueued for {}/{} (correlation {})",
            to_short_id(&build_id),
            spec.namespace,
            spec.function,
            to_short_id(&correlation_id)
        );

        self.emit(
            LifecycleKind::BuildStarted,
            Some(format!("{}/{}", spec.namespace, spec.function)),
            &BuildStartedData {
                function: spec.function.clone(),
                namespace: spec.namespace.clone(),
                job_name: job_name.clone(),
                build_id,
                started_at: chrono::Utc::now(),
            },
            correlation_id,
            Some(event.id.clone()),
            Some(format!("{job_name}:started:{correlation_id}")),
        )
        .await;

        self.clone()
            .spawn_outcome_watcher(correlation_id, job_name.clone(), spec.clone(), event.id.clone());

        let mut reply = CommandReply::accepted(correlation_id);
        reply.build_id = Some(build_id);
        reply.job_name = Some(job_name);

        if sync {
            // Diagnostic path: wait for the worker outcome under the command
            // deadline (the outer timeout still applies).
            if let Some(outcome) = self.creator.wait(correlation_id, self.config.command_deadline).await {
                let created = outcome?;
                reply.outcome = ReplyOutcome::Completed;
                reply.job_name = Some(created.job_name);
            }
        }

        Ok(reply)
    }

    /// Watches the queued build's slot and converts its eventual outcome into
    /// lifecycle events. Runs detached: command deadlines do not cancel it.
    fn spawn_outcome_watcher(self: Arc<Self>, correlation_id: Uuid, job_name: String, spec: FunctionSpec, cause: String) {
        tokio::spawn(async move {
            let wait_budget = self.config.build_timeout;
            match self.creator.wait(correlation_id, wait_budget).await {
                Some(Ok(created)) => {
                    self.metrics.inc(CounterEvent::JobCreated);
                    for superseded in &created.superseded {
                        self.emit(
                            LifecycleKind::BuildCancelled,
                            Some(format!("{}/{}", superseded.namespace, superseded.function)),
                            &BuildCancelledData {
                                function: superseded.function.clone(),
                                namespace: superseded.namespace.clone(),
                                job_name: superseded.job_name.clone(),
                            },
                            superseded.correlation_id,
                            Some(cause.clone()),
                            Some(format!("{}:cancelled", superseded.job_name)),
                        )
                        .await;
                    }
                }
                Some(Err(err)) => {
                    warn!("build scheduling failed for correlation {}: {}", correlation_id, err);
                    self.metrics.inc(CounterEvent::JobFailed);
                    self.emit(
                        LifecycleKind::BuildFailed,
                        Some(format!("{}/{}", spec.namespace, spec.function)),
                        &BuildFailedData {
                            function: spec.function.clone(),
                            namespace: spec.namespace.clone(),
                            job_name: job_name.clone(),
                            error: ErrorData::from(&err),
                            duration: 0,
                        },
                        correlation_id,
                        Some(cause.clone()),
                        Some(format!("{job_name}:failed:schedule")),
                    )
                    .await;
                }
                None => warn!(
                    "no scheduling outcome for correlation {} within {:?}",
                    correlation_id, wait_budget
                ),
            }
        });
    }

    // command.build.cancel

    async fn cancel_builds(
        self: &Arc<Self>,
        data: BuildCancelData,
        event: &CloudEvent,
        correlation_id: Uuid,
    ) -> Result<CommandReply, EngineError> {
        let cancelled = self
            .job_manager
            .cancel_jobs(&data.function, &data.namespace)
            .await
            .map_err(EngineError::from)?;

        for job in &cancelled {
            // The cancelled event terminates the *build's* chain, not the
            // cancel command's.
            let chain = job.correlation_id.unwrap_or(correlation_id);
            self.emit(
                LifecycleKind::BuildCancelled,
                Some(format!("{}/{}", job.namespace, job.function)),
                &BuildCancelledData {
                    function: job.function.clone(),
                    namespace: job.namespace.clone(),
                    job_name: job.name.clone(),
                },
                chain,
                Some(event.id.clone()),
                Some(format!("{}:cancelled", job.name)),
            )
            .await;
        }

        Ok(CommandReply::completed(correlation_id)
            .with_message(format!("{} build(s) cancelled", cancelled.len())))
    }

    // command.service.create / .update

    async fn apply_service(
        self: &Arc<Self>,
        data: ServiceCommandData,
        event: &CloudEvent,
        correlation_id: Uuid,
    ) -> Result<CommandReply, EngineError> {
        let image = data.image.clone().ok_or_else(|| {
            EngineError::new_from_safe(
                ErrorKind::Validation,
                "service command requires an image reference".to_string(),
            )
        })?;

        let mut serving = ServingSpec::default();
        if let Some(scaling) = data.scaling.clone() {
            serving.scaling = scaling;
        }
        if let Some(env) = data.env.clone() {
            serving.env = env;
        }

        let outcome = self
            .service_manager
            .create_or_update(&data.function, &data.namespace, &image, &serving)
            .await
            .map_err(EngineError::from)?;

        self.emit_service_outcome(&data.function, &data.namespace, Some(image), outcome, correlation_id, &event.id)
            .await;

        Ok(CommandReply::completed(correlation_id))
    }

    // command.service.delete

    async fn remove_service(
        self: &Arc<Self>,
        data: ServiceDeleteData,
        event: &CloudEvent,
        correlation_id: Uuid,
    ) -> Result<CommandReply, EngineError> {
        let mutated = self
            .service_manager
            .delete(&data.function, &data.namespace)
            .await
            .map_err(EngineError::from)?;

        if mutated {
            self.metrics.inc(CounterEvent::ServiceDeleted);
        }

        self.emit(
            LifecycleKind::ServiceDeleted,
            Some(format!("{}/{}", data.namespace, data.function)),
            &ServiceLifecycleData {
                function: data.function.clone(),
                namespace: data.namespace.clone(),
                image: None,
            },
            correlation_id,
            Some(event.id.clone()),
            None,
        )
        .await;

        Ok(CommandReply::completed(correlation_id))
    }

    // command.function.rollback

    async fn rollback_function(
        self: &Arc<Self>,
        data: RollbackData,
        event: &CloudEvent,
        correlation_id: Uuid,
    ) -> Result<CommandReply, EngineError> {
        let (outcome, image) = self
            .service_manager
            .rollback(&data.function, &data.namespace)
            .await
            .map_err(EngineError::from)?;

        self.emit_service_outcome(&data.function, &data.namespace, Some(image), outcome, correlation_id, &event.id)
            .await;

        Ok(CommandReply::completed(correlation_id))
    }

    // lifecycle.build.completed (sidecar or informer)

    async fn on_build_completed(
        self: &Arc<Self>,
        data: BuildCompletedData,
        event: &CloudEvent,
        correlation_id: Uuid,
    ) -> Result<CommandReply, EngineError> {
        self.metrics.inc(CounterEvent::JobSucceeded);
        self.metrics.observe_phase(
            Phase::Build,
            None,
            Duration::from_millis(data.duration),
            Some(correlation_id),
        );

        // The serving half of the original spec travels on the job.
        let serving = self
            .job_manager
            .get_job(&data.namespace, &data.job_name)
            .await
            .ok()
            .flatten()
            .and_then(|job| job.serving_spec)
            .unwrap_or_default();

        let image = ImageRef {
            uri: data.image_uri.clone(),
            digest: data.digest.clone(),
        };

        let deploy_started = Instant::now();
        let outcome = self
            .service_manager
            .create_or_update(&data.function, &data.namespace, &image, &serving)
            .await
            .map_err(EngineError::from)?;
        self.metrics
            .observe_phase(Phase::Deploy, None, deploy_started.elapsed(), Some(correlation_id));

        self.emit_service_outcome(
            &data.function,
            &data.namespace,
            Some(image.clone()),
            outcome,
            correlation_id,
            &event.id,
        )
        .await;

        let url = self
            .service_manager
            .service_url(&data.function, &data.namespace)
            .await
            .map_err(EngineError::from)?;

        self.emit(
            LifecycleKind::ServiceReady,
            Some(format!("{}/{}", data.namespace, data.function)),
            &ServiceReadyData {
                function: data.function.clone(),
                namespace: data.namespace.clone(),
                url,
                image_digest: image.digest,
            },
            correlation_id,
            Some(event.id.clone()),
            Some(format!("{}:ready", data.job_name)),
        )
        .await;

        self.metrics.observe_phase(
            Phase::EndToEnd,
            None,
            Duration::from_millis(data.duration) + deploy_started.elapsed(),
            Some(correlation_id),
        );

        Ok(CommandReply::completed(correlation_id))
    }

    // lifecycle.build.failed / .timeout

    async fn on_build_failed(
        self: &Arc<Self>,
        data: BuildFailedData,
        event: &CloudEvent,
        correlation_id: Uuid,
    ) -> Result<CommandReply, EngineError> {
        self.metrics.inc(CounterEvent::JobFailed);
        self.metrics.observe_phase(
            Phase::Build,
            None,
            Duration::from_millis(data.duration),
            Some(correlation_id),
        );

        let existing_service = self
            .service_manager
            .service_exists(&data.function, &data.namespace)
            .await
            .map_err(EngineError::from)?;

        let (kind, key_suffix) = if existing_service {
            // The previous image keeps serving; the function is degraded, not
            // down.
            (LifecycleKind::FunctionDegraded, "degraded")
        } else {
            (LifecycleKind::FunctionFailed, "failed")
        };

        self.emit(
            kind,
            Some(format!("{}/{}", data.namespace, data.function)),
            &FunctionDegradedData {
                function: data.function.clone(),
                namespace: data.namespace.clone(),
                error: data.error.clone(),
            },
            correlation_id,
            Some(event.id.clone()),
            Some(format!("{}:{}", data.job_name, key_suffix)),
        )
        .await;

        Ok(CommandReply::completed(correlation_id))
    }

    async fn emit_service_outcome(
        self: &Arc<Self>,
        function: &str,
        namespace: &str,
        image: Option<ImageRef>,
        outcome: ServiceOutcome,
        correlation_id: Uuid,
        cause: &str,
    ) {
        let kind = match outcome {
            ServiceOutcome::Created => {
                self.metrics.inc(CounterEvent::ServiceCreated);
                LifecycleKind::ServiceCreated
            }
            ServiceOutcome::Updated => {
                self.metrics.inc(CounterEvent::ServiceUpdated);
                LifecycleKind::ServiceUpdated
            }
            // Re-applying identical desired state makes no observable change
            // and emits nothing.
            ServiceOutcome::Unchanged => return,
        };

        self.emit(
            kind,
            Some(format!("{namespace}/{function}")),
            &ServiceLifecycleData {
                function: function.to_string(),
                namespace: namespace.to_string(),
                image,
            },
            correlation_id,
            Some(cause.to_string()),
            None,
        )
        .await;
    }

    /// Emits one lifecycle event. Publication is at-least-once with local
    /// retries inside the publisher; a final failure is logged and left to
    /// the informer fallback.
    async fn emit<T: Serialize>(
        &self,
        kind: LifecycleKind,
        subject: Option<String>,
        data: &T,
        correlation_id: Uuid,
        causation_id: Option<String>,
        idempotency_key: Option<String>,
    ) {
        let payload = match serde_json::to_value(data) {
            Ok(payload) => payload,
            Err(err) => {
                error!("cannot serialize {} payload: {}", EventType::Lifecycle(kind), err);
                return;
            }
        };

        let event = CloudEvent::new_emitted(
            EventType::Lifecycle(kind),
            subject,
            payload,
            correlation_id,
            causation_id,
            idempotency_key,
        );

        if let Err(err) = self.publisher.publish(&event).await {
            error!(
                "cannot publish {} for correlation {}: {}",
                event.event_type,
                correlation_id,
                err.raw_error_message().unwrap_or_else(|| err.to_string())
            );
        } else if kind.is_terminal() {
            debug!("chain {} closed with {}", correlation_id, event.event_type);
        }
    }

    fn correlation_lock(&self, correlation_id: Uuid) -> CorrelationLock {
        let mut hasher = DefaultHasher::new();
        correlation_id.hash(&mut hasher);
        let shard = (hasher.finish() as usize) % self.inflight.len();

        let mut locks = self.inflight[shard].lock().expect("inflight lock poisoned");
        if let Some(lock) = locks.get(&correlation_id) {
            return lock.clone();
        }
        let lock: CorrelationLock = Arc::new(tokio::sync::Mutex::new(()));
        locks.put(correlation_id, lock.clone());
        lock
    }

    fn idempotency_get(&self, key: &str) -> Option<StoredOutcome> {
        let mut cache = self.idempotency.lock().expect("idempotency lock poisoned");
        cache.get(key).cloned()
    }

    fn idempotency_put(&self, key: String, outcome: StoredOutcome) {
        let mut cache = self.idempotency.lock().expect("idempotency lock poisoned");
        cache.put(key, outcome);
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(event: &CloudEvent) -> Result<T, EngineError> {
    serde_json::from_value(event.data.clone()).map_err(|err| {
        EngineError::new(
            ErrorKind::Validation,
            format!("malformed payload for `{}`", event.event_type),
            Some(err.to_string()),
        )
    })
}

/// HTTP mapping of the error taxonomy, used by the ingress layer.
pub fn http_status_for(err: &EngineError) -> u16 {
    match err.kind() {
        ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::AlreadyExists => 400,
        ErrorKind::Forbidden => 403,
        ErrorKind::Conflict => 409,
        ErrorKind::ResourceExhausted => 429,
        ErrorKind::Timeout => 504,
        ErrorKind::Transient => 503,
        ErrorKind::Internal => 500,
    }
}
