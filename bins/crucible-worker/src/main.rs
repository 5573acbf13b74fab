mod errors;
mod languages;
mod orchestrator;
mod pool;
mod sandbox;
mod sanitize;
mod worker;


use anyhow::Context;
use crucible_common::cache::Cache;
use crucible_common::config::Config;
use orchestrator::Orchestrator;
use pool::SandboxPool;
use sandbox::SandboxRuntime;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use worker::QueueWorker;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Crucible worker booting...");

    let config = Config::from_env();
    info!(
        languages = ?config.languages,
        concurrency = config.worker.concurrency,
        max_retries = config.worker.max_retries,
        execution_timeout_ms = config.docker.execution_timeout_ms,
        "configuration loaded"
    );

    let cache = Cache::connect(&config.redis)
        .await
        .context("Failed to connect to Redis")?;
    info!(cluster = config.redis.cluster_enabled, "connected to Redis");

    let runtime = SandboxRuntime::connect(config.docker.clone())?;
    runtime.ping().await?;
    info!("connected to Docker daemon");

    let pool = SandboxPool::new(runtime.clone(), &config);
    pool.initialize()
        .await
        .context("Failed to initialize sandbox pools")?;
    info!(pool_size = config.worker.concurrency, "sandbox pools ready");

    let orchestrator = Orchestrator::new(pool.clone(), runtime);
    let worker = QueueWorker::new(config, cache, orchestrator);

    tokio::select! {
        _ = worker.run() => {},
        _ = shutdown_signal() => warn!("received shutdown signal, draining..."),
    }

    // Shutdown order matters: stop consuming (select above), drain
    // in-flight executions, then tear down the sandboxes they used.
    worker.drain(DRAIN_TIMEOUT).await;
    pool.shutdown().await;

    info!("worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
