use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::{EngineError, ErrorKind};
use crate::job::{BuildJobRequest, JobManager, SupersededBuild};
use crate::utilities::to_short_id;

/// CreatedJob: what a worker writes into the winning correlation's slot.
#[derive(Clone, Debug)]
pub struct CreatedJob {
    pub job_name: String,
    pub namespace: String,
    pub function: String,
    pub fingerprint: String,
    pub superseded: Vec<SupersededBuild>,
}

/// SlotOutcome: what a status poller observes for a correlation id.
#[derive(Clone, Debug)]
pub enum SlotOutcome {
    Pending,
    Done(Result<CreatedJob, EngineError>),
}

struct SlotEntry {
    tx: watch::Sender<SlotOutcome>,
    updated_at: Instant,
}

struct QueuedBuild {
    request: BuildJobRequest,
    /// Correlations whose queued request this one coalesced away.
    coalesced: Vec<SupersededBuild>,
}

/// AsyncJobCreator: a bounded queue in front of the JobManager so the ingress
/// answers fast while job creation happens on a fixed worker pool.
///
/// Guarantees: requests are never dropped silently (`queue_full` is an
/// explicit outcome), a queued request with the same fingerprint is coalesced
/// into the newer one, and every outcome stays readable by correlation id for
/// the retention window.
pub struct AsyncJobCreator {
    queue: Mutex<VecDeque<QueuedBuild>>,
    queue_capacity: usize,
    notify: Notify,
    slots: Mutex<HashMap<Uuid, SlotEntry>>,
    slot_retention: Duration,
    limiter: DefaultDirectRateLimiter,
    job_manager: Arc<JobManager>,
    cancel: CancellationToken,
}

impl AsyncJobCreator {
    pub fn new(
        job_manager: Arc<JobManager>,
        queue_capacity: usize,
        jobs_per_second: u32,
        slot_retention: Duration,
    ) -> Arc<Self> {
        let quota = Quota::per_second(NonZeroU32::new(jobs_per_second).unwrap_or(nonzero!(1u32)));

        Arc::new(AsyncJobCreator {
            queue: Mutex::new(VecDeque::new()),
            queue_capacity,
            notify: Notify::new(),
            slots: Mutex::new(HashMap::new()),
            slot_retention,
            limiter: RateLimiter::direct(quota),
            job_manager,
            cancel: CancellationToken::new(),
        })
    }

    /// Creates the pool and spawns its workers.
    pub fn start(
        job_manager: Arc<JobManager>,
        queue_capacity: usize,
        worker_count: usize,
        jobs_per_second: u32,
        slot_retention: Duration,
    ) -> Arc<Self> {
        let creator = Self::new(job_manager, queue_capacity, jobs_per_second, slot_retention);
        for worker_id in 0..worker_count {
            let creator = creator.clone();
            tokio::spawn(async move { creator.worker_loop(worker_id).await });
        }
        creator
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Enqueues a request. Returns immediately; the outcome lands in the
    /// correlation slot. `resource_exhausted` when the queue is at capacity,
    /// with no state modified.
    pub fn submit(&self, request: BuildJobRequest) -> Result<(), EngineError> {
        self.prune_slots();

        let correlation_id = request.correlation_id;
        let fingerprint_short = request.context.fingerprint.short();

        {
            let mut queue = self.queue.lock().expect("creator queue lock poisoned");

            if let Some(queued) = queue
                .iter_mut()
                .find(|item| item.request.context.fingerprint.short() == fingerprint_short)
            {
                // Coalesce: the newer request takes the queued one's place,
                // and the replaced chain terminates as superseded.
                debug!(
                    "coalescing queued build {} into {}",
                    to_short_id(&queued.request.correlation_id),
                    to_short_id(&correlation_id)
                );
                queued.coalesced.push(SupersededBuild {
                    correlation_id: queued.request.correlation_id,
                    job_name: queued.request.context.fingerprint.job_name(),
                    function: queued.request.spec.function.clone(),
                    namespace: queued.request.spec.namespace.clone(),
                });
                queued.request = request;
                self.install_slot(correlation_id);
                self.notify.notify_one();
                return Ok(());
            }

            if queue.len() >= self.queue_capacity {
                return Err(EngineError::new_from_safe(
                    ErrorKind::ResourceExhausted,
                    format!("Build queue is full ({} entries)", self.queue_capacity),
                ));
            }

            // Slot before push: a worker may pop the request the moment the
            // queue lock drops.
            self.install_slot(correlation_id);
            queue.push_back(QueuedBuild {
                request,
                coalesced: Vec::new(),
            });
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Synchronous diagnostic path: waits for the slot to resolve, bounded by
    /// a deadline. `None` when the deadline expires or the slot is unknown.
    pub async fn wait(&self, correlation_id: Uuid, deadline: Duration) -> Option<Result<CreatedJob, EngineError>> {
        let mut rx = {
            let slots = self.slots.lock().expect("creator slots lock poisoned");
            slots.get(&correlation_id)?.tx.subscribe()
        };

        let resolved = tokio::time::timeout(deadline, rx.wait_for(|state| matches!(state, SlotOutcome::Done(_))))
            .await
            .ok()?
            .ok()?;

        match &*resolved {
            SlotOutcome::Done(outcome) => Some(outcome.clone()),
            SlotOutcome::Pending => None,
        }
    }

    /// Non-blocking read for late status pollers.
    pub fn peek(&self, correlation_id: Uuid) -> Option<SlotOutcome> {
        let slots = self.slots.lock().expect("creator slots lock poisoned");
        slots.get(&correlation_id).map(|entry| entry.tx.borrow().clone())
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().expect("creator queue lock poisoned").len()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("job creator worker {} started", worker_id);

        loop {
            let queued = {
                let mut queue = self.queue.lock().expect("creator queue lock poisoned");
                queue.pop_front()
            };

            let Some(queued) = queued else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.notify.notified() => continue,
                }
            };

            self.limiter.until_ready().await;
            self.process(queued).await;
        }

        debug!("job creator worker {} stopped", worker_id);
    }

    async fn process(&self, queued: QueuedBuild) {
        let correlation_id = queued.request.correlation_id;

        let outcome = match AssertUnwindSafe(self.job_manager.create_job(&queued.request))
            .catch_unwind()
            .await
        {
            Ok(Ok((job, mut superseded))) => {
                superseded.extend(queued.coalesced.iter().cloned());
                Ok(CreatedJob {
                    job_name: job.name,
                    namespace: job.namespace,
                    function: job.function,
                    fingerprint: job.fingerprint,
                    superseded,
                })
            }
            Ok(Err(err)) => Err(EngineError::from(err)),
            Err(_) => {
                error!("job creation worker panicked for correlation {}", correlation_id);
                Err(EngineError::new_internal(
                    "Build scheduling failed unexpectedly".to_string(),
                    Some("worker panicked in create_job".to_string()),
                ))
            }
        };

        self.resolve_slot(correlation_id, outcome.clone());
        for coalesced in &queued.coalesced {
            // Identical fingerprint: the replaced request's outcome is the
            // winner's outcome.
            self.resolve_slot(coalesced.correlation_id, outcome.clone());
        }
    }

    fn install_slot(&self, correlation_id: Uuid) {
        let (tx, _rx) = watch::channel(SlotOutcome::Pending);
        let mut slots = self.slots.lock().expect("creator slots lock poisoned");
        slots.insert(
            correlation_id,
            SlotEntry {
                tx,
                updated_at: Instant::now(),
            },
        );
    }

    fn resolve_slot(&self, correlation_id: Uuid, outcome: Result<CreatedJob, EngineError>) {
        let mut slots = self.slots.lock().expect("creator slots lock poisoned");
        match slots.get_mut(&correlation_id) {
            Some(entry) => {
                entry.updated_at = Instant::now();
                // send_replace stores the value even with no live receiver,
                // so late pollers still observe it
                entry.tx.send_replace(SlotOutcome::Done(outcome));
            }
            None => warn!("no result slot for correlation {}", correlation_id),
        }
    }

    /// Terminal slots are kept for the retention window so late pollers still
    /// read the outcome, then dropped.
    fn prune_slots(&self) {
        let mut slots = self.slots.lock().expect("creator slots lock poisoned");
        let retention = self.slot_retention;
        slots.retain(|_, entry| {
            let terminal = matches!(*entry.tx.borrow(), SlotOutcome::Done(_));
            !terminal || entry.updated_at.elapsed() < retention
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_context::BuildContext;
    use crate::io_models::{
        Fingerprint, FunctionSpec, ResourceSpec, RuntimeKind, RuntimeSpec, ScalingSpec, SourceSpec,
    };
    use crate::job::tests_support::NoopKube;
    use crate::object_storage::{ObjectStorage, ObjectStorageError};
    use async_trait::async_trait;
    use maplit::btreemap;
    use url::Url;

    struct PresignOnlyStorage;

    #[async_trait]
    impl ObjectStorage for PresignOnlyStorage {
        async fn put(&self, _key: &str, _body: Vec<u8>) -> Result<(), ObjectStorageError> {
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStorageError> {
            Err(ObjectStorageError::ObjectNotFound { key: key.to_string() })
        }

        async fn presign(&self, key: &str, _ttl: Duration) -> Result<Url, ObjectStorageError> {
            Ok(Url::parse(&format!("https://storage.test/{key}")).expect("static url"))
        }
    }

    fn job_manager() -> Arc<JobManager> {
        Arc::new(JobManager::new(
            Arc::new(NoopKube),
            Arc::new(PresignOnlyStorage),
            "builder:latest".to_string(),
            "sidecar:latest".to_string(),
            "registry.local:5000".to_string(),
            "http://broker.test".to_string(),
            Duration::from_secs(1800),
            Duration::from_secs(3600),
            10,
        ))
    }

    fn request(function: &str, content_digest: &str) -> BuildJobRequest {
        let spec = FunctionSpec {
            function: function.to_string(),
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
        let fingerprint = Fingerprint::new(&spec, content_digest.to_string());
        BuildJobRequest {
            context: BuildContext {
                context_key: fingerprint.context_key(),
                fingerprint,
                archive_size: 64,
                created_at: chrono::Utc::now(),
            },
            spec,
            correlation_id: Uuid::new_v4(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_queue_full_rejects_without_state_change() {
        // no workers: nothing drains the queue
        let creator = AsyncJobCreator::new(job_manager(), 2, 10, Duration::from_secs(900));

        assert!(creator.submit(request("f1", "sha256:1")).is_ok());
        assert!(creator.submit(request("f2", "sha256:2")).is_ok());

        let rejected = request("f3", "sha256:3");
        let rejected_id = rejected.correlation_id;
        let err = creator.submit(rejected).expect_err("queue must be full");
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        assert_eq!(creator.queue_depth(), 2);
        assert!(creator.peek(rejected_id).is_none(), "rejected submission left a slot");
    }

    #[tokio::test]
    async fn test_same_fingerprint_coalesces_while_queued() {
        let creator = AsyncJobCreator::new(job_manager(), 8, 10, Duration::from_secs(900));

        let first = request("hello", "sha256:same");
        let first_id = first.correlation_id;
        let second = request("hello", "sha256:same");
        let second_id = second.correlation_id;

        creator.submit(first).expect("first submit");
        creator.submit(second).expect("second submit");

        // one queue entry, two live slots
        assert_eq!(creator.queue_depth(), 1);
        assert!(matches!(creator.peek(first_id), Some(SlotOutcome::Pending)));
        assert!(matches!(creator.peek(second_id), Some(SlotOutcome::Pending)));
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_queue_separately() {
        let creator = AsyncJobCreator::new(job_manager(), 8, 10, Duration::from_secs(900));

        creator.submit(request("hello", "sha256:a")).expect("first");
        creator.submit(request("hello", "sha256:b")).expect("second");

        assert_eq!(creator.queue_depth(), 2);
    }

    #[tokio::test]
    async fn test_worker_resolves_slot() {
        let creator = AsyncJobCreator::start(job_manager(), 8, 2, 100, Duration::from_secs(900));

        let request = request("hello", "sha256:abc");
        let correlation_id = request.correlation_id;
        let expected_job_name = request.context.fingerprint.job_name();

        creator.submit(request).expect("submit");

        let outcome = creator
            .wait(correlation_id, Duration::from_secs(5))
            .await
            .expect("slot must resolve")
            .expect("creation must succeed");

        assert_eq!(outcome.job_name, expected_job_name);
        assert_eq!(outcome.function, "hello");
        assert!(outcome.superseded.is_empty());

        // terminal outcome stays readable
        assert!(matches!(creator.peek(correlation_id), Some(SlotOutcome::Done(Ok(_)))));
        creator.shutdown();
    }

    #[tokio::test]
    async fn test_coalesced_chain_resolves_with_winner_outcome() {
        let creator = AsyncJobCreator::new(job_manager(), 8, 100, Duration::from_secs(900));

        let first = request("hello", "sha256:same");
        let first_id = first.correlation_id;
        let second = request("hello", "sha256:same");
        let second_id = second.correlation_id;

        creator.submit(first).expect("first");
        creator.submit(second).expect("second");

        // drain by hand instead of spawning workers
        let queued = creator.queue.lock().expect("lock").pop_front().expect("one entry");
        creator.process(queued).await;

        let winner = creator
            .wait(second_id, Duration::from_secs(1))
            .await
            .expect("winner resolved")
            .expect("winner ok");
        assert_eq!(winner.superseded.len(), 1);
        assert_eq!(winner.superseded[0].correlation_id, first_id);

        let coalesced = creator
            .wait(first_id, Duration::from_secs(1))
            .await
            .expect("coalesced resolved")
            .expect("coalesced ok");
        assert_eq!(coalesced.job_name, winner.job_name);
    }
}
