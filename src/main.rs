// fieldhand worker binary.
//
// Claims queued runs from the store and executes them until interrupted.
// Configuration comes from the environment; see the FIELDHAND_* variables
// below.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fieldhand::{Orchestrator, OrchestratorConfig};

fn config_from_env() -> OrchestratorConfig {
    let mut builder = OrchestratorConfig::builder();

    if let Ok(path) = std::env::var("FIELDHAND_DB") {
        builder = builder.store_path(path);
    }
    if let Ok(dir) = std::env::var("FIELDHAND_VAULT") {
        builder = builder.vault_dir(dir);
    }
    if let Ok(keys) = std::env::var("FIELDHAND_PROVIDER_KEYS") {
        builder = builder.provider_api_keys(&keys);
    }
    if let Ok(n) = std::env::var("FIELDHAND_WORKERS") {
        if let Ok(n) = n.parse::<usize>() {
            builder = builder.worker_concurrency(n);
        }
    }
    if let Ok(n) = std::env::var("FIELDHAND_MAX_ATTEMPTS") {
        if let Ok(n) = n.parse::<u32>() {
            builder = builder.max_attempts(n);
        }
    }
    if let Ok(rate) = std::env::var("FIELDHAND_RATE_RPS") {
        if let Ok(rate) = rate.parse::<f64>() {
            builder = builder.politeness_rate_rps(rate);
        }
    }
    if std::env::var("FIELDHAND_HEADFUL").is_ok() {
        builder = builder.headless(false);
    }

    builder.build()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = config_from_env();
    info!(
        store = %config.store_path().display(),
        vault = %config.vault_dir().display(),
        workers = config.worker_concurrency(),
        provider = config.provider_enabled(),
        "fieldhand starting"
    );

    let orchestrator = Orchestrator::init(config)
        .await
        .context("orchestrator init failed")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = orchestrator.worker();
    let worker_task = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    shutdown_tx.send(true).ok();
    worker_task.await.context("worker task join failed")?;

    info!("fieldhand stopped");
    Ok(())
}
