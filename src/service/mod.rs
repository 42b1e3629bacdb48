use std::collections::BTreeMap;
use std::sync::Arc;

use kube::CustomResource;
use kube::api::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RetryPolicy;
use crate::constants::{
    ANNOTATION_PREVIOUS_IMAGE, LABEL_FUNCTION, LABEL_MANAGED_BY, LABEL_NAMESPACE, MANAGED_BY,
};
use crate::io_models::{FunctionSpec, ImageRef, ResourceSpec, ScalingSpec};
use crate::kube_client::{KubeAdapterError, KubernetesAdapter};

/// AutoScaledService: the user-facing auto-scaled HTTP endpoint, materialized
/// once a build succeeds. The cluster is the only store for it.
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "serving.lambda.dev",
    version = "v1",
    kind = "AutoScaledService",
    namespaced,
    status = "AutoScaledServiceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AutoScaledServiceSpec {
    /// Pinned image reference (`uri@sha256:...`) from a completed build.
    pub image: String,
    pub min_scale: u32,
    pub max_scale: u32,
    pub target_concurrency: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    pub handler_path: String,
    pub readiness_path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoScaledServiceStatus {
    pub url: Option<String>,
    pub ready: Option<bool>,
}

/// Subscription: broker-to-service binding, owned one-to-one by its service.
#[derive(CustomResource, Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "eventing.lambda.dev", version = "v1", kind = "Subscription", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSpec {
    pub service: String,
    pub broker: String,
    pub filters: Vec<String>,
}

#[derive(Clone, Error, Debug)]
pub enum ServiceError {
    #[error("Giving up on service `{name}` after {attempts} write conflicts.")]
    ConflictRetriesExhausted { name: String, attempts: usize },
    #[error("No previous image recorded for function `{function}`; cannot roll back.")]
    MissingImage { function: String },
    #[error(transparent)]
    Kube(#[from] KubeAdapterError),
}

/// The serving-relevant half of a function spec. Stamped as an annotation on
/// build jobs so the deploy step can run from cluster state alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServingSpec {
    pub scaling: ScalingSpec,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceSpec,
    pub handler: String,
}

impl From<&FunctionSpec> for ServingSpec {
    fn from(spec: &FunctionSpec) -> Self {
        ServingSpec {
            scaling: spec.scaling.clone(),
            env: spec.env.clone(),
            resources: spec.resources.clone(),
            handler: spec.handler.clone(),
        }
    }
}

impl Default for ServingSpec {
    fn default() -> Self {
        ServingSpec {
            scaling: ScalingSpec::default(),
            env: BTreeMap::new(),
            resources: ResourceSpec::default(),
            handler: "handler".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceOutcome {
    Created,
    Updated,
    Unchanged,
}

/// ServiceManager: materializes the serving resource and its subscription,
/// idempotently, with bounded conflict retries.
pub struct ServiceManager {
    kube: Arc<dyn KubernetesAdapter>,
    broker: String,
    event_filters: Vec<String>,
    retry: RetryPolicy,
}

pub fn subscription_name(function: &str) -> String {
    format!("{function}-subscription")
}

fn owned_labels(function: &str, namespace: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_FUNCTION.to_string(), function.to_string()),
        (LABEL_NAMESPACE.to_string(), namespace.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

impl ServiceManager {
    pub fn new(
        kube: Arc<dyn KubernetesAdapter>,
        broker: String,
        event_filters: Vec<String>,
        retry: RetryPolicy,
    ) -> Self {
        ServiceManager {
            kube,
            broker,
            event_filters,
            retry,
        }
    }

    fn desired_spec(&self, image: &ImageRef, serving: &ServingSpec) -> AutoScaledServiceSpec {
        AutoScaledServiceSpec {
            image: image.full_ref(),
            min_scale: serving.scaling.min_scale,
            max_scale: serving.scaling.max_scale,
            target_concurrency: serving.scaling.target_concurrency,
            env: serving.env.clone(),
            resources: serving.resources.clone(),
            handler_path: serving.handler.clone(),
            readiness_path: "/healthz".to_string(),
        }
    }

    fn desired_subscription(&self, function: &str, namespace: &str) -> Subscription {
        Subscription {
            metadata: ObjectMeta {
                name: Some(subscription_name(function)),
                namespace: Some(namespace.to_string()),
                labels: Some(owned_labels(function, namespace)),
                ..Default::default()
            },
            spec: SubscriptionSpec {
                service: function.to_string(),
                broker: self.broker.clone(),
                filters: self.event_filters.clone(),
            },
        }
    }

    /// Applies the desired service. Re-applying the same desired state yields
    /// no write at all; a genuine change preserves the prior image in an
    /// annotation so `function.rollback` can find it.
    pub async fn create_or_update(
        &self,
        function: &str,
        namespace: &str,
        image: &ImageRef,
        serving: &ServingSpec,
    ) -> Result<ServiceOutcome, ServiceError> {
        let desired_spec = self.desired_spec(image, serving);
        let mut outcome = ServiceOutcome::Unchanged;

        for attempt in 0..self.retry.max_attempts {
            let existing = self.kube.get_service(namespace, function).await?;

            let write_result = match existing {
                None => {
                    let service = AutoScaledService {
                        metadata: ObjectMeta {
                            name: Some(function.to_string()),
                            namespace: Some(namespace.to_string()),
                            labels: Some(owned_labels(function, namespace)),
                            ..Default::default()
                        },
                        spec: desired_spec.clone(),
                        status: None,
                    };
                    outcome = ServiceOutcome::Created;
                    self.kube.create_service(namespace, service).await.map(|_| ())
                }
                Some(current) if current.spec == desired_spec => {
                    debug!("service {}/{} already at desired state", namespace, function);
                    self.upsert_subscription(function, namespace).await?;
                    return Ok(ServiceOutcome::Unchanged);
                }
                Some(current) => {
                    let mut annotations = current.metadata.annotations.clone().unwrap_or_default();
                    annotations.insert(ANNOTATION_PREVIOUS_IMAGE.to_string(), current.spec.image.clone());

                    let service = AutoScaledService {
                        metadata: ObjectMeta {
                            name: Some(function.to_string()),
                            namespace: Some(namespace.to_string()),
                            labels: Some(owned_labels(function, namespace)),
                            annotations: Some(annotations),
                            resource_version: current.metadata.resource_version.clone(),
                            ..Default::default()
                        },
                        spec: desired_spec.clone(),
                        status: current.status.clone(),
                    };
                    outcome = ServiceOutcome::Updated;
                    self.kube.update_service(namespace, service).await.map(|_| ())
                }
            };

            match write_result {
                Ok(()) => {
                    self.upsert_subscription(function, namespace).await?;
                    return Ok(outcome);
                }
                Err(KubeAdapterError::Conflict { .. }) | Err(KubeAdapterError::AlreadyExists { .. }) => {
                    warn!(
                        "write conflict on service {}/{} (attempt {}), re-reading",
                        namespace,
                        function,
                        attempt + 1
                    );
                    tokio::time::sleep(self.retry.jittered_delay(attempt)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(ServiceError::ConflictRetriesExhausted {
            name: function.to_string(),
            attempts: self.retry.max_attempts,
        })
    }

    async fn upsert_subscription(&self, function: &str, namespace: &str) -> Result<(), ServiceError> {
        let desired = self.desired_subscription(function, namespace);
        let name = subscription_name(function);

        for attempt in 0..self.retry.max_attempts {
            let result = match self.kube.get_subscription(namespace, &name).await? {
                None => self.kube.create_subscription(namespace, desired.clone()).await.map(|_| ()),
                Some(current) if current.spec == desired.spec => return Ok(()),
                Some(current) => {
                    let mut replacement = desired.clone();
                    replacement.metadata.resource_version = current.metadata.resource_version.clone();
                    self.kube.update_subscription(namespace, replacement).await.map(|_| ())
                }
            };

            match result {
                Ok(()) => return Ok(()),
                Err(KubeAdapterError::Conflict { .. }) | Err(KubeAdapterError::AlreadyExists { .. }) => {
                    tokio::time::sleep(self.retry.jittered_delay(attempt)).await;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(ServiceError::ConflictRetriesExhausted {
            name,
            attempts: self.retry.max_attempts,
        })
    }

    /// Deletes the subscription first so no events route to a dying service,
    /// then the service. `NotFound` on either is success. Returns whether any
    /// cluster mutation actually happened.
    pub async fn delete(&self, function: &str, namespace: &str) -> Result<bool, ServiceError> {
        let mut mutated = false;

        match self.kube.delete_subscription(namespace, &subscription_name(function)).await {
            Ok(()) => mutated = true,
            Err(KubeAdapterError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        match self.kube.delete_service(namespace, function).await {
            Ok(()) => mutated = true,
            Err(KubeAdapterError::NotFound { .. }) => {}
            Err(err) => return Err(err.into()),
        }

        Ok(mutated)
    }

    pub async fn service_exists(&self, function: &str, namespace: &str) -> Result<bool, ServiceError> {
        Ok(self.kube.get_service(namespace, function).await?.is_some())
    }

    /// The previously-known-good image recorded at the last update, for
    /// `command.function.rollback`.
    pub async fn previous_image(&self, function: &str, namespace: &str) -> Result<String, ServiceError> {
        let service = self
            .kube
            .get_service(namespace, function)
            .await?
            .ok_or_else(|| ServiceError::MissingImage {
                function: function.to_string(),
            })?;

        service
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_PREVIOUS_IMAGE))
            .cloned()
            .ok_or_else(|| ServiceError::MissingImage {
                function: function.to_string(),
            })
    }

    /// Re-applies the previously-known-good image recorded at the last
    /// update. Returns the image rolled back to.
    pub async fn rollback(&self, function: &str, namespace: &str) -> Result<(ServiceOutcome, ImageRef), ServiceError> {
        let current = self
            .kube
            .get_service(namespace, function)
            .await?
            .ok_or_else(|| ServiceError::MissingImage {
                function: function.to_string(),
            })?;

        let previous = self.previous_image(function, namespace).await?;
        let image = ImageRef::parse(&previous);

        let serving = ServingSpec {
            scaling: ScalingSpec {
                min_scale: current.spec.min_scale,
                max_scale: current.spec.max_scale,
                target_concurrency: current.spec.target_concurrency,
            },
            env: current.spec.env.clone(),
            resources: current.spec.resources.clone(),
            handler: current.spec.handler_path.clone(),
        };

        let outcome = self.create_or_update(function, namespace, &image, &serving).await?;
        Ok((outcome, image))
    }

    /// Routable URL of the service: the status URL when the serving layer has
    /// populated it, the in-cluster form otherwise.
    pub async fn service_url(&self, function: &str, namespace: &str) -> Result<String, ServiceError> {
        let status_url = self
            .kube
            .get_service(namespace, function)
            .await?
            .and_then(|service| service.status.and_then(|status| status.url));

        Ok(status_url.unwrap_or_else(|| format!("http://{function}.{namespace}.svc.cluster.local")))
    }
}
