use std::process::ExitCode;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use mailhaus_infra::config::WorkerConfig;
use mailhaus_infra::db;
use mailhaus_worker::app::{Stores, build_worker};

#[tokio::main]
async fn main() -> ExitCode {
    mailhaus_observability::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "worker exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("invalid configuration")?;
    let pool = db::connect(&config)
        .await
        .context("failed to connect to postgres")?;

    let worker = build_worker(&config, Stores::postgres(pool)).context("failed to build worker")?;
    let running = worker.start(CancellationToken::new());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    running.shutdown().await;
    tracing::info!("worker stopped");
    Ok(())
}
