//! Informer fallback: lifecycle notifications are normally published by the
//! job sidecar, but a broker outage or a sidecar crash must not lose them.
//! This loop re-derives terminal lifecycle events from cluster state; the
//! deterministic idempotency keys make the two delivery paths collapse into
//! one observable event.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::Api;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher;
use tokio_util::sync::CancellationToken;

use crate::errors::EngineError;
use crate::events::io::{BuildCompletedData, BuildFailedData, ErrorData};
use crate::events::{CloudEvent, EventType, LifecycleKind};
use crate::job::{BuildJob, BuildJobStatus, managed_selector, terminal_idempotency_key};
use crate::kube_client::KubernetesAdapter;
use crate::orchestrator::Orchestrator;

/// Translates a terminal job observation into the lifecycle event the sidecar
/// would have published. `None` for non-terminal jobs and jobs without a
/// correlation annotation.
pub fn lifecycle_event_for(build: &BuildJob, registry_url: &str) -> Option<CloudEvent> {
    let correlation_id = build.correlation_id?;
    let subject = Some(format!("{}/{}", build.namespace, build.function));
    let idempotency_key = Some(terminal_idempotency_key(&build.name, build.status));

    let (kind, data) = match build.status {
        BuildJobStatus::Completed => {
            // The sidecar reports the pushed digest; from here the reference
            // is pinned by its content-derived fingerprint tag instead.
            let data = BuildCompletedData {
                function: build.function.clone(),
                namespace: build.namespace.clone(),
                job_name: build.name.clone(),
                image_uri: format!(
                    "{}/{}/{}:{}",
                    registry_url, build.namespace, build.function, build.fingerprint
                ),
                digest: String::new(),
                duration: build.duration_ms(),
            };
            (LifecycleKind::BuildCompleted, serde_json::to_value(data).ok()?)
        }
        BuildJobStatus::Failed | BuildJobStatus::Timeout => {
            let timed_out = build.status == BuildJobStatus::Timeout;
            let data = BuildFailedData {
                function: build.function.clone(),
                namespace: build.namespace.clone(),
                job_name: build.name.clone(),
                error: ErrorData {
                    code: if timed_out { "timeout" } else { "internal" }.to_string(),
                    message: build
                        .message
                        .clone()
                        .unwrap_or_else(|| "build job failed".to_string()),
                    retryable: timed_out,
                },
                duration: build.duration_ms(),
            };
            let kind = if timed_out {
                LifecycleKind::BuildTimeout
            } else {
                LifecycleKind::BuildFailed
            };
            (kind, serde_json::to_value(data).ok()?)
        }
        // Cancellations are emitted at supersede/cancel time by the
        // orchestrator itself.
        BuildJobStatus::Cancelled | BuildJobStatus::Pending | BuildJobStatus::Running => return None,
    };

    Some(CloudEvent::new_emitted(
        EventType::Lifecycle(kind),
        subject,
        data,
        correlation_id,
        None,
        idempotency_key,
    ))
}

/// Periodic full re-list of managed jobs. The interval must stay under the
/// sidecar's publish retry budget so nothing falls between the two paths.
pub struct Reconciler {
    kube: Arc<dyn KubernetesAdapter>,
    orchestrator: Arc<Orchestrator>,
    registry_url: String,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        kube: Arc<dyn KubernetesAdapter>,
        orchestrator: Arc<Orchestrator>,
        registry_url: String,
        interval: Duration,
    ) -> Self {
        Reconciler {
            kube,
            orchestrator,
            registry_url,
            interval,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("reconcile loop started (every {:?})", self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.sweep().await {
                Ok(0) => {}
                Ok(handled) => debug!("reconcile sweep re-derived {} lifecycle event(s)", handled),
                Err(err) => warn!("reconcile sweep failed: {}", err),
            }
        }

        info!("reconcile loop stopped");
    }

    /// One pass over every managed job; duplicates are absorbed by the
    /// orchestrator's idempotency window.
    pub async fn sweep(&self) -> Result<usize, EngineError> {
        let jobs = self
            .kube
            .list_jobs_all(&managed_selector())
            .await
            .map_err(EngineError::from)?;

        let mut handled = 0;
        for job in &jobs {
            let Some(build) = BuildJob::from_k8s_job(job) else {
                continue;
            };
            let Some(event) = lifecycle_event_for(&build, &self.registry_url) else {
                continue;
            };

            if let Err(err) = self.orchestrator.handle(event, false).await {
                warn!("reconcile of job {}/{} failed: {}", build.namespace, build.name, err);
            } else {
                handled += 1;
            }
        }

        Ok(handled)
    }
}

/// Live watch over managed jobs, feeding the same translation as the sweep.
/// Runs alongside the periodic re-list; the sweep is the guarantee, the watch
/// is the latency.
pub async fn watch_jobs(
    client: kube::Client,
    orchestrator: Arc<Orchestrator>,
    registry_url: String,
    cancel: CancellationToken,
) {
    let api: Api<Job> = Api::all(client);
    let config = watcher::Config::default().labels(&managed_selector());
    let stream = watcher(api, config).default_backoff().applied_objects();
    futures::pin_mut!(stream);

    info!("job informer started");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(job)) => {
                let Some(build) = BuildJob::from_k8s_job(&job) else {
                    continue;
                };
                let Some(event) = lifecycle_event_for(&build, &registry_url) else {
                    continue;
                };
                if let Err(err) = orchestrator.handle(event, false).await {
                    warn!("informer handling of job {}/{} failed: {}", build.namespace, build.name, err);
                }
            }
            Some(Err(err)) => warn!("job watch error: {}", err),
            None => break,
        }
    }

    info!("job informer stopped");
}
