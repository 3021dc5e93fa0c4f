// Worker binary entry point
// Consumes the configured queues until Ctrl+C, then flushes and exits

use anyhow::{Context, Result};
use clap::Parser;
use common::config::Settings;
use common::db::{DbPool, PgJobStore};
use common::models::Job;
use common::telemetry;
use common::worker::{cancel_after, job_handler, JobHandler, JobOutcome};
use common::Scheduler;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Long-running swag queue worker
#[derive(Parser, Debug)]
#[command(name = "swag-worker", version, about)]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, env = "SWAG_CONFIG_DIR", default_value = "config")]
    config_dir: String,

    /// Queues to consume; overrides `worker.queues`
    #[arg(long = "queue", value_name = "QUEUE")]
    queues: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from_path(&cli.config_dir)
        .with_context(|| format!("Failed to load configuration from {}", cli.config_dir))?;
    if !cli.queues.is_empty() {
        settings.worker.queues = cli.queues;
    }
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    if settings.observability.metrics_port != 0 {
        telemetry::init_metrics(settings.observability.metrics_port)?;
    }

    info!(queues = ?settings.worker.queues, "Starting swag worker");
    if settings.worker.queues.is_empty() {
        anyhow::bail!("No queues configured; set worker.queues or pass --queue");
    }

    let pool = DbPool::new(&settings.database)
        .await
        .context("Database initialization error")?;
    pool.health_check().await.context("Database health check failed")?;
    let store = PgJobStore::new(pool.clone(), settings.store.table_ref());
    let scheduler = Scheduler::new(Arc::new(store));

    if let Some(max_attempts) = settings.worker.cancel_after {
        info!(max_attempts, "Failing jobs are cancelled after repeated attempts");
        scheduler.on_error(cancel_after(max_attempts)).await;
    }

    for queue in &settings.worker.queues {
        scheduler
            .on(queue, log_handler(), settings.worker.options.clone())
            .await
            .with_context(|| format!("Failed to start worker for queue {queue}"))?;
    }

    info!(
        worker_id = scheduler.worker_id(),
        "Worker is running. Press Ctrl+C to shutdown gracefully"
    );

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    let stopped = scheduler.stop_all().await;
    pool.close().await;
    telemetry::shutdown_tracer();

    stopped.context("Failed to flush pending completions")?;
    info!("Worker shutdown complete");
    Ok(())
}

/// Logs each job and keeps it on its schedule
fn log_handler() -> JobHandler {
    job_handler(|job: Job| async move {
        info!(
            queue = %job.queue,
            job_id = %job.id,
            run_at = %job.run_at,
            attempts = job.attempts,
            data = %job.data,
            "Running job"
        );
        Ok(JobOutcome::Continue)
    })
}
