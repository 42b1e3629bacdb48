use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lambda_engine::build_context::BuildContextManager;
use lambda_engine::config::EngineConfig;
use lambda_engine::constants::EVENT_TYPE_PREFIX;
use lambda_engine::ingress::{IngressState, event_router, ops_router};
use lambda_engine::job::JobManager;
use lambda_engine::job::creator::AsyncJobCreator;
use lambda_engine::kube_client::KubeAdapter;
use lambda_engine::metrics_registry::StdMetricsRecorder;
use lambda_engine::msg_publisher::HttpEventPublisher;
use lambda_engine::object_storage::s3::S3ObjectStorage;
use lambda_engine::orchestrator::Orchestrator;
use lambda_engine::orchestrator::reconcile::{Reconciler, watch_jobs};
use lambda_engine::service::ServiceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::from_env().map_err(|reason| anyhow!(reason))?;
    info!("starting lambda-engine on {}", config.ingress_bind);

    let kube_client = kube::Client::try_default()
        .await
        .context("cannot build kubernetes client")?;
    let adapter = Arc::new(KubeAdapter::new(kube_client.clone()));

    let object_storage = Arc::new(S3ObjectStorage::new(
        config.temp_bucket.clone(),
        config.s3_region.clone(),
        config.s3_endpoint.clone(),
        config.s3_access_key_id.clone(),
        config.s3_secret_access_key.clone(),
    ));

    let publisher = Arc::new(HttpEventPublisher::new(config.broker_url.clone(), config.retry.clone()));
    let metrics = Arc::new(StdMetricsRecorder::new());

    let build_context = BuildContextManager::new(
        object_storage.clone(),
        std::env::temp_dir().to_string_lossy().to_string(),
        config.max_archive_bytes,
    );

    let job_manager = Arc::new(JobManager::new(
        adapter.clone(),
        object_storage.clone(),
        config.builder_image.clone(),
        config.sidecar_image.clone(),
        config.registry_url.clone(),
        config.broker_url.to_string(),
        config.build_timeout,
        config.presign_ttl,
        config.max_concurrent_builds_per_namespace,
    ));

    let creator = AsyncJobCreator::start(
        job_manager.clone(),
        config.queue_capacity,
        config.worker_count,
        config.jobs_per_second,
        config.slot_retention,
    );

    let service_manager = ServiceManager::new(
        adapter.clone(),
        config.broker_url.to_string(),
        vec![format!("{EVENT_TYPE_PREFIX}.invoke")],
        config.retry.clone(),
    );

    let orchestrator = Orchestrator::new(
        config.clone(),
        publisher,
        metrics.clone(),
        build_context,
        job_manager,
        creator.clone(),
        service_manager,
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let reconciler = Reconciler::new(
        adapter.clone(),
        orchestrator.clone(),
        config.registry_url.clone(),
        config.reconcile_interval,
    );
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { reconciler.run(cancel).await });
    }
    {
        let orchestrator = orchestrator.clone();
        let registry_url = config.registry_url.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watch_jobs(kube_client, orchestrator, registry_url, cancel).await });
    }

    let state = Arc::new(IngressState {
        orchestrator,
        metrics,
    });

    let ingress_listener = tokio::net::TcpListener::bind(config.ingress_bind)
        .await
        .context("cannot bind ingress listener")?;
    let ops_listener = tokio::net::TcpListener::bind(config.ops_bind)
        .await
        .context("cannot bind ops listener")?;

    info!("ingress on {}, ops on {}", config.ingress_bind, config.ops_bind);

    let ingress_cancel = cancel.clone();
    let ops_cancel = cancel.clone();
    let ingress = axum::serve(ingress_listener, event_router(state.clone()))
        .with_graceful_shutdown(async move { ingress_cancel.cancelled().await });
    let ops = axum::serve(ops_listener, ops_router(state))
        .with_graceful_shutdown(async move { ops_cancel.cancelled().await });

    let (ingress_result, ops_result) = tokio::join!(async { ingress.await }, async { ops.await });
    ingress_result.context("ingress server failed")?;
    ops_result.context("ops server failed")?;

    creator.shutdown();
    info!("lambda-engine stopped");
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    error!("cannot install SIGTERM handler: {}", err);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        info!("shutdown signal received, draining");
        cancel.cancel();
    });
}
