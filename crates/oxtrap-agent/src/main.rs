mod account;
mod aws;
mod config;
mod instance;
mod supervisor;

use anyhow::{bail, Result};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::aws::AwsInstanceFactory;
use crate::supervisor::ServiceSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());
    let config = config::AgentConfig::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(config.log_directive().parse()?))
        .init();

    tracing::info!(config = %config_path, version = env!("CARGO_PKG_VERSION"), "oxtrap-agent starting");

    let mut supervisors = Vec::new();
    if config.aws.enabled {
        match ServiceSupervisor::new("aws", &config.aws.conf_dir, &AwsInstanceFactory).await {
            Ok(supervisor) => supervisors.push(supervisor),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "disabling aws"),
        }
    }
    if supervisors.is_empty() {
        bail!("no providers with usable accounts");
    }

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for supervisor in supervisors {
        tracing::info!(provider = supervisor.provider(), instances = supervisor.len(), "starting provider");
        tasks.spawn(supervisor.run(cancel.clone()));
    }

    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "listening for shutdown signal");
    }
    tracing::info!("Received shutdown signal, stopping");
    cancel.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "provider task failed");
        }
    }
    tracing::info!("oxtrap-agent stopped");
    Ok(())
}
