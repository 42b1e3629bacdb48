//! The reporter container co-scheduled with every builder. It watches the
//! builder's terminal state, reads the pushed image reference from the shared
//! volume, and publishes the terminal lifecycle event. If the broker stays
//! unreachable past the publish budget the process exits non-zero, failing
//! the job so the informer fallback takes over.

use std::env;
use std::path::Path;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use url::Url;
use uuid::Uuid;

use crate::config::RetryPolicy;
use crate::constants::{
    BUILDER_CONTAINER_NAME, ENV_BROKER_URL, ENV_CORRELATION_ID, ENV_FUNCTION_NAME, ENV_JOB_NAME, ENV_JOB_NAMESPACE,
    ENV_POD_NAME, IMAGE_DIGEST_FILE,
};
use crate::events::io::{BuildCompletedData, BuildFailedData, ErrorData};
use crate::events::{CloudEvent, EventType, LifecycleKind};
use crate::io_models::ImageRef;
use crate::job::{BuildJobStatus, terminal_idempotency_key};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_PUBLISH_BUDGET: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
pub struct SidecarConfig {
    pub job_name: String,
    pub namespace: String,
    pub function: String,
    pub correlation_id: Uuid,
    pub broker_url: Url,
    pub pod_name: String,
    pub poll_interval: Duration,
    pub publish_budget: Duration,
}

impl SidecarConfig {
    pub fn from_env() -> Result<Self, String> {
        let required = |key: &str| env::var(key).map_err(|_| format!("missing environment variable {key}"));

        Ok(SidecarConfig {
            job_name: required(ENV_JOB_NAME)?,
            namespace: required(ENV_JOB_NAMESPACE)?,
            function: required(ENV_FUNCTION_NAME)?,
            correlation_id: Uuid::parse_str(&required(ENV_CORRELATION_ID)?)
                .map_err(|err| format!("invalid {ENV_CORRELATION_ID}: {err}"))?,
            broker_url: Url::parse(&required(ENV_BROKER_URL)?)
                .map_err(|err| format!("invalid {ENV_BROKER_URL}: {err}"))?,
            pod_name: required(ENV_POD_NAME)?,
            poll_interval: DEFAULT_POLL_INTERVAL,
            publish_budget: DEFAULT_PUBLISH_BUDGET,
        })
    }
}

/// How the builder container ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuilderOutcome {
    Succeeded,
    Failed { exit_code: i32, reason: Option<String> },
    /// Killed by the job's active deadline.
    TimedOut,
}

/// Polls the pod until the builder container reaches a terminated state.
pub async fn wait_for_builder(
    pods: &Api<Pod>,
    config: &SidecarConfig,
) -> Result<(BuilderOutcome, Duration), String> {
    let started = Instant::now();

    loop {
        let pod = pods
            .get(&config.pod_name)
            .await
            .map_err(|err| format!("cannot read pod {}: {err}", config.pod_name))?;

        let terminated = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| {
                statuses
                    .iter()
                    .find(|status| status.name == BUILDER_CONTAINER_NAME)
                    .and_then(|status| status.state.as_ref())
                    .and_then(|state| state.terminated.clone())
            });

        if let Some(terminated) = terminated {
            let outcome = match terminated.exit_code {
                0 => BuilderOutcome::Succeeded,
                // SIGKILL/SIGTERM from the job deadline
                137 | 143 => BuilderOutcome::TimedOut,
                code => BuilderOutcome::Failed {
                    exit_code: code,
                    reason: terminated.reason,
                },
            };
            return Ok((outcome, started.elapsed()));
        }

        tokio::time::sleep(config.poll_interval).await;
    }
}

/// Reads the image reference the builder wrote to the shared volume.
pub fn read_image_reference(path: &Path) -> Option<ImageRef> {
    let raw = std::fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(ImageRef::parse(trimmed))
}

/// Composes the terminal lifecycle event for an observed builder outcome.
/// The idempotency key matches the informer fallback's, so double delivery
/// collapses downstream.
pub fn compose_terminal_event(
    config: &SidecarConfig,
    outcome: &BuilderOutcome,
    image: Option<&ImageRef>,
    duration: Duration,
) -> CloudEvent {
    let subject = Some(format!("{}/{}", config.namespace, config.function));
    let duration_ms = duration.as_millis() as u64;

    let (kind, status, data) = match outcome {
        BuilderOutcome::Succeeded => {
            let image = image.cloned().unwrap_or(ImageRef {
                uri: String::new(),
                digest: String::new(),
            });
            let data = BuildCompletedData {
                function: config.function.clone(),
                namespace: config.namespace.clone(),
                job_name: config.job_name.clone(),
                image_uri: image.uri,
                digest: image.digest,
                duration: duration_ms,
            };
            (
                LifecycleKind::BuildCompleted,
                BuildJobStatus::Completed,
                serde_json::to_value(data).unwrap_or_default(),
            )
        }
        BuilderOutcome::TimedOut => {
            let data = BuildFailedData {
                function: config.function.clone(),
                namespace: config.namespace.clone(),
                job_name: config.job_name.clone(),
                error: ErrorData {
                    code: "timeout".to_string(),
                    message: "build exceeded its deadline".to_string(),
                    retryable: true,
                },
                duration: duration_ms,
            };
            (
                LifecycleKind::BuildTimeout,
                BuildJobStatus::Timeout,
                serde_json::to_value(data).unwrap_or_default(),
            )
        }
        BuilderOutcome::Failed { exit_code, reason } => {
            let data = BuildFailedData {
                function: config.function.clone(),
                namespace: config.namespace.clone(),
                job_name: config.job_name.clone(),
                error: ErrorData {
                    code: "internal".to_string(),
                    message: format!(
                        "builder exited with code {exit_code}{}",
                        reason
                            .as_ref()
                            .map(|reason| format!(" ({reason})"))
                            .unwrap_or_default()
                    ),
                    retryable: false,
                },
                duration: duration_ms,
            };
            (
                LifecycleKind::BuildFailed,
                BuildJobStatus::Failed,
                serde_json::to_value(data).unwrap_or_default(),
            )
        }
    };

    CloudEvent::new_emitted(
        EventType::Lifecycle(kind),
        subject,
        data,
        config.correlation_id,
        None,
        Some(terminal_idempotency_key(&config.job_name, status)),
    )
}

/// Publishes with exponential backoff until the budget is spent. An `Err`
/// here means the caller must exit non-zero.
pub async fn publish_with_budget(config: &SidecarConfig, event: &CloudEvent) -> Result<(), String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();
    let policy = RetryPolicy::default();
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        let result = client
            .post(config.broker_url.clone())
            .header("content-type", "application/cloudevents+json")
            .json(event)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => warn!("broker answered {} for {}", response.status(), event.event_type),
            Err(err) => warn!("cannot reach broker: {}", err),
        }

        let delay = policy.jittered_delay(attempt);
        if started.elapsed() + delay > config.publish_budget {
            return Err(format!(
                "publish budget of {:?} exhausted after {} attempts",
                config.publish_budget,
                attempt + 1
            ));
        }
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

/// Full reporter flow, driven by the `lambda-sidecar` binary.
pub async fn run(config: SidecarConfig, client: kube::Client) -> Result<(), String> {
    let pods: Api<Pod> = Api::namespaced(client, &config.namespace);

    let (outcome, duration) = wait_for_builder(&pods, &config).await?;
    info!("builder for {} finished: {:?} after {:?}", config.job_name, outcome, duration);

    let image = match &outcome {
        BuilderOutcome::Succeeded => {
            let image = read_image_reference(Path::new(IMAGE_DIGEST_FILE));
            if image.is_none() {
                // Broken contract: a successful builder must leave its output
                return Err(format!("builder succeeded but {IMAGE_DIGEST_FILE} is missing or empty"));
            }
            image
        }
        _ => None,
    };

    let event = compose_terminal_event(&config, &outcome, image.as_ref(), duration);
    publish_with_budget(&config, &event).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config() -> SidecarConfig {
        SidecarConfig {
            job_name: "build-hello-abc123def456".to_string(),
            namespace: "ns1".to_string(),
            function: "hello".to_string(),
            correlation_id: Uuid::new_v4(),
            broker_url: Url::parse("http://broker.test").expect("static url"),
            pod_name: "build-hello-abc123def456-x7z".to_string(),
            poll_interval: Duration::from_millis(10),
            publish_budget: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_read_image_reference() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "registry.local/ns1/hello@sha256:deadbeef").expect("write");

        let image = read_image_reference(file.path()).expect("image parses");
        assert_eq!(image.uri, "registry.local/ns1/hello");
        assert_eq!(image.digest, "sha256:deadbeef");
    }

    #[test]
    fn test_read_image_reference_empty_file() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        assert!(read_image_reference(file.path()).is_none());
    }

    #[test]
    fn test_completed_event_contract() {
        let config = config();
        let image = ImageRef {
            uri: "registry.local/ns1/hello".to_string(),
            digest: "sha256:abc".to_string(),
        };

        let event = compose_terminal_event(
            &config,
            &BuilderOutcome::Succeeded,
            Some(&image),
            Duration::from_secs(42),
        );

        assert_eq!(event.event_type, "io.knative.lambda.lifecycle.build.completed");
        assert_eq!(event.correlationid, Some(config.correlation_id));
        assert_eq!(
            event.idempotencykey.as_deref(),
            Some("build-hello-abc123def456:completed")
        );
        assert_eq!(event.data["digest"], "sha256:abc");
        assert_eq!(event.data["duration"], 42_000);
    }

    #[test]
    fn test_failure_kinds() {
        let config = config();

        let timeout = compose_terminal_event(&config, &BuilderOutcome::TimedOut, None, Duration::from_secs(1));
        assert_eq!(timeout.event_type, "io.knative.lambda.lifecycle.build.timeout");
        assert_eq!(timeout.data["error"]["retryable"], true);

        let failed = compose_terminal_event(
            &config,
            &BuilderOutcome::Failed {
                exit_code: 2,
                reason: Some("Error".to_string()),
            },
            None,
            Duration::from_secs(1),
        );
        assert_eq!(failed.event_type, "io.knative.lambda.lifecycle.build.failed");
        assert_eq!(failed.data["error"]["retryable"], false);
        assert!(
            failed.data["error"]["message"]
                .as_str()
                .expect("message")
                .contains("code 2")
        );
    }
}
