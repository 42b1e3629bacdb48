use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::service::{AutoScaledService, Subscription};

/// Client-side bound on every single API call; the command-level deadline
/// composes on top of this.
const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Error, Debug, PartialEq, Eq)]
pub enum KubeAdapterError {
    #[error("{kind} `{name}` not found.")]
    NotFound { kind: String, name: String },
    #[error("{kind} `{name}` already exists.")]
    AlreadyExists { kind: String, name: String },
    #[error("Write conflict on {kind} `{name}`.")]
    Conflict {
        kind: String,
        name: String,
        raw_error_message: String,
    },
    #[error("Operation on {kind} forbidden.")]
    Forbidden { kind: String, raw_error_message: String },
    #[error("Kubernetes API timed out on {kind}.")]
    Timeout { kind: String, raw_error_message: String },
    #[error("Kubernetes API unavailable for {kind}.")]
    Transient { kind: String, raw_error_message: String },
    #[error("Invalid {kind} resource: {reason}.")]
    InvalidResource { kind: String, reason: String },
}

impl KubeAdapterError {
    pub fn raw_error_message(&self) -> Option<String> {
        match self {
            KubeAdapterError::Conflict { raw_error_message, .. }
            | KubeAdapterError::Forbidden { raw_error_message, .. }
            | KubeAdapterError::Timeout { raw_error_message, .. }
            | KubeAdapterError::Transient { raw_error_message, .. } => Some(raw_error_message.clone()),
            _ => None,
        }
    }
}

fn map_kube_error(kind: &str, name: &str, err: kube::Error) -> KubeAdapterError {
    match err {
        kube::Error::Api(ErrorResponse { code, reason, message, .. }) => match code {
            404 => KubeAdapterError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 if reason == "AlreadyExists" => KubeAdapterError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            409 => KubeAdapterError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                raw_error_message: message,
            },
            401 | 403 => KubeAdapterError::Forbidden {
                kind: kind.to_string(),
                raw_error_message: message,
            },
            408 | 504 => KubeAdapterError::Timeout {
                kind: kind.to_string(),
                raw_error_message: message,
            },
            _ => KubeAdapterError::Transient {
                kind: kind.to_string(),
                raw_error_message: format!("status {code}: {message}"),
            },
        },
        other => KubeAdapterError::Transient {
            kind: kind.to_string(),
            raw_error_message: other.to_string(),
        },
    }
}

/// KubernetesAdapter: the narrow, typed cluster surface everything above the
/// API boundary depends on. Mutations carry idempotency labels set by the
/// callers; reads keep resourceVersion so a write-after-read collision comes
/// back as `Conflict` for the caller to retry.
#[async_trait]
pub trait KubernetesAdapter: Send + Sync {
    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, KubeAdapterError>;
    /// Foreground cascade; `NotFound` is surfaced so callers can treat
    /// idempotent deletes as success.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError>;
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, KubeAdapterError>;
    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, KubeAdapterError>;
    /// Cluster-wide listing for the reconcile loop.
    async fn list_jobs_all(&self, label_selector: &str) -> Result<Vec<Job>, KubeAdapterError>;

    async fn create_service(&self, namespace: &str, service: AutoScaledService)
    -> Result<AutoScaledService, KubeAdapterError>;
    async fn update_service(&self, namespace: &str, service: AutoScaledService)
    -> Result<AutoScaledService, KubeAdapterError>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<AutoScaledService>, KubeAdapterError>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError>;

    async fn create_subscription(&self, namespace: &str, subscription: Subscription)
    -> Result<Subscription, KubeAdapterError>;
    async fn update_subscription(&self, namespace: &str, subscription: Subscription)
    -> Result<Subscription, KubeAdapterError>;
    async fn get_subscription(&self, namespace: &str, name: &str) -> Result<Option<Subscription>, KubeAdapterError>;
    async fn delete_subscription(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError>;
}

/// kube.rs-backed adapter used by the binaries. Tests inject fakes of the
/// trait instead.
#[derive(Clone)]
pub struct KubeAdapter {
    client: kube::Client,
}

impl KubeAdapter {
    pub fn new(client: kube::Client) -> Self {
        KubeAdapter { client }
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn bounded<T, F>(kind: &str, call: F) -> Result<T, KubeAdapterError>
where
    F: Future<Output = Result<T, KubeAdapterError>>,
{
    match tokio::time::timeout(API_CALL_TIMEOUT, call).await {
        Ok(result) => result,
        Err(_) => Err(KubeAdapterError::Timeout {
            kind: kind.to_string(),
            raw_error_message: format!("client-side deadline of {API_CALL_TIMEOUT:?} expired"),
        }),
    }
}

async fn create_resource<K>(api: Api<K>, resource: K) -> Result<K, KubeAdapterError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let name = resource.name_any();
    debug!("creating k8s {} {}", kind, name);

    api.create(&PostParams::default(), &resource)
        .await
        .map_err(|err| map_kube_error(&kind, &name, err))
}

async fn replace_resource<K>(api: Api<K>, resource: K) -> Result<K, KubeAdapterError>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let name = resource.name_any();
    if resource.meta().resource_version.is_none() {
        // Replacing without a resourceVersion would clobber concurrent writers
        return Err(KubeAdapterError::InvalidResource {
            kind,
            reason: format!("update of `{name}` requires a resourceVersion from a prior read"),
        });
    }
    debug!("replacing k8s {} {}", kind, name);

    api.replace(&name, &PostParams::default(), &resource)
        .await
        .map_err(|err| map_kube_error(&kind, &name, err))
}

async fn get_resource<K>(api: Api<K>, name: &str) -> Result<Option<K>, KubeAdapterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    match api.get(name).await {
        Ok(resource) => Ok(Some(resource)),
        Err(err) => match map_kube_error(&kind, name, err) {
            KubeAdapterError::NotFound { .. } => Ok(None),
            other => Err(other),
        },
    }
}

async fn list_resources<K>(api: Api<K>, label_selector: &str) -> Result<Vec<K>, KubeAdapterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let params = ListParams::default().labels(label_selector);
    let list = api
        .list(&params)
        .await
        .map_err(|err| map_kube_error(&kind, label_selector, err))?;
    Ok(list.items)
}

async fn delete_resource<K>(api: Api<K>, name: &str) -> Result<(), KubeAdapterError>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    debug!("deleting k8s {} {}", kind, name);

    api.delete(name, &DeleteParams::foreground())
        .await
        .map(|_| ())
        .map_err(|err| map_kube_error(&kind, name, err))
}

#[async_trait]
impl KubernetesAdapter for KubeAdapter {
    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, KubeAdapterError> {
        bounded("Job", create_resource(self.api::<Job>(namespace), job)).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError> {
        bounded("Job", delete_resource(self.api::<Job>(namespace), name)).await
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, KubeAdapterError> {
        bounded("Job", get_resource(self.api::<Job>(namespace), name)).await
    }

    async fn list_jobs(&self, namespace: &str, label_selector: &str) -> Result<Vec<Job>, KubeAdapterError> {
        bounded("Job", list_resources(self.api::<Job>(namespace), label_selector)).await
    }

    async fn list_jobs_all(&self, label_selector: &str) -> Result<Vec<Job>, KubeAdapterError> {
        bounded("Job", list_resources(Api::<Job>::all(self.client.clone()), label_selector)).await
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: AutoScaledService,
    ) -> Result<AutoScaledService, KubeAdapterError> {
        bounded(
            "AutoScaledService",
            create_resource(self.api::<AutoScaledService>(namespace), service),
        )
        .await
    }

    async fn update_service(
        &self,
        namespace: &str,
        service: AutoScaledService,
    ) -> Result<AutoScaledService, KubeAdapterError> {
        bounded(
            "AutoScaledService",
            replace_resource(self.api::<AutoScaledService>(namespace), service),
        )
        .await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<AutoScaledService>, KubeAdapterError> {
        bounded(
            "AutoScaledService",
            get_resource(self.api::<AutoScaledService>(namespace), name),
        )
        .await
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError> {
        bounded(
            "AutoScaledService",
            delete_resource(self.api::<AutoScaledService>(namespace), name),
        )
        .await
    }

    async fn create_subscription(
        &self,
        namespace: &str,
        subscription: Subscription,
    ) -> Result<Subscription, KubeAdapterError> {
        bounded(
            "Subscription",
            create_resource(self.api::<Subscription>(namespace), subscription),
        )
        .await
    }

    async fn update_subscription(
        &self,
        namespace: &str,
        subscription: Subscription,
    ) -> Result<Subscription, KubeAdapterError> {
        bounded(
            "Subscription",
            replace_resource(self.api::<Subscription>(namespace), subscription),
        )
        .await
    }

    async fn get_subscription(&self, namespace: &str, name: &str) -> Result<Option<Subscription>, KubeAdapterError> {
        bounded(
            "Subscription",
            get_resource(self.api::<Subscription>(namespace), name),
        )
        .await
    }

    async fn delete_subscription(&self, namespace: &str, name: &str) -> Result<(), KubeAdapterError> {
        bounded(
            "Subscription",
            delete_resource(self.api::<Subscription>(namespace), name),
        )
        .await
    }
}
