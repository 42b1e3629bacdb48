use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::config::RetryPolicy;
use crate::events::CloudEvent;

#[derive(Clone, Error, Debug)]
pub enum PublishError {
    #[error("Broker unreachable.")]
    BrokerUnreachable { raw_error_message: String },
    #[error("Broker rejected the event with status {status}.")]
    Rejected { status: u16, raw_error_message: String },
}

impl PublishError {
    pub fn raw_error_message(&self) -> Option<String> {
        match self {
            PublishError::BrokerUnreachable { raw_error_message }
            | PublishError::Rejected { raw_error_message, .. } => Some(raw_error_message.clone()),
        }
    }
}

/// EventPublisher: delivery of lifecycle events to the broker. At-least-once;
/// consumers dedup on the idempotency key.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &CloudEvent) -> Result<(), PublishError>;
}

/// HTTP publisher posting structured-mode CloudEvents to the broker ingress,
/// retrying transient failures per the standard backoff policy.
pub struct HttpEventPublisher {
    client: reqwest::Client,
    broker_url: Url,
    retry: RetryPolicy,
}

impl HttpEventPublisher {
    pub fn new(broker_url: Url, retry: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        HttpEventPublisher {
            client,
            broker_url,
            retry,
        }
    }

    async fn post_once(&self, event: &CloudEvent) -> Result<(), PublishError> {
        let response = self
            .client
            .post(self.broker_url.clone())
            .header("content-type", "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .map_err(|err| PublishError::BrokerUnreachable {
                raw_error_message: err.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(PublishError::BrokerUnreachable {
                raw_error_message: format!("status {status}: {body}"),
            })
        } else {
            Err(PublishError::Rejected {
                status: status.as_u16(),
                raw_error_message: body,
            })
        }
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, event: &CloudEvent) -> Result<(), PublishError> {
        let mut last_err = None;

        for attempt in 0..self.retry.max_attempts {
            match self.post_once(event).await {
                Ok(()) => return Ok(()),
                Err(err @ PublishError::Rejected { .. }) => return Err(err),
                Err(err) => {
                    warn!(
                        "cannot publish {} (attempt {}): {}",
                        event.event_type,
                        attempt + 1,
                        err
                    );
                    last_err = Some(err);
                    tokio::time::sleep(self.retry.jittered_delay(attempt)).await;
                }
            }
        }

        Err(last_err.unwrap_or(PublishError::BrokerUnreachable {
            raw_error_message: "no attempt made".to_string(),
        }))
    }
}

/// In-memory publisher for tests and single-process runs; records everything
/// it is handed, in order.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<CloudEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CloudEvent> {
        self.events.lock().expect("publisher lock poisoned").clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<CloudEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.event_type == event_type)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: &CloudEvent) -> Result<(), PublishError> {
        debug!("publishing {} ({})", event.event_type, event.id);
        self.events.lock().expect("publisher lock poisoned").push(event.clone());
        Ok(())
    }
}
