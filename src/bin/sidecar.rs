use anyhow::{Context, anyhow};
use tracing::{error, info};

use lambda_engine::sidecar::{self, SidecarConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SidecarConfig::from_env().map_err(|reason| anyhow!(reason))?;
    info!("sidecar reporter started for job {}", config.job_name);

    let client = kube::Client::try_default()
        .await
        .context("cannot build kubernetes client")?;

    match sidecar::run(config, client).await {
        Ok(()) => {
            info!("terminal lifecycle event published");
            Ok(())
        }
        Err(reason) => {
            // A non-zero exit fails the job; the controller's informer
            // fallback then re-derives the lifecycle event from job status.
            error!("reporter failed: {}", reason);
            std::process::exit(1);
        }
    }
}
