// Admin CLI entry point
// Bootstraps the jobs table, manages schedules and evaluates expressions

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use common::config::Settings;
use common::db::{DbPool, PgJobStore};
use common::expression::{format_instant, parse_instant, relative_to_iso, ScheduleExpression};
use common::store::JobStore;
use common::telemetry;
use common::Scheduler;
use std::sync::Arc;
use tracing::info;

/// Manage swag job schedules
#[derive(Parser, Debug)]
#[command(name = "swag", version, about)]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, env = "SWAG_CONFIG_DIR", default_value = "config", global = true)]
    config_dir: String,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "SWAG_LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the jobs table and its indexes
    Init,

    /// Schedule a job, replacing any job with the same id
    Schedule {
        queue: String,
        id: String,
        /// Instant, cron text, repeating interval or `cancel`
        expression: String,
        /// JSON payload handed to the job handler
        #[arg(long, default_value = "null")]
        data: String,
        /// Keep the current run time of an existing job
        #[arg(long)]
        preserve_run_at: bool,
    },

    /// Remove one job, or the whole queue when no id is given
    Remove { queue: String, id: Option<String> },

    /// Print the next run time of an expression
    Next {
        expression: String,
        /// Previous run time
        #[arg(long, value_parser = parse_instant_arg)]
        from: Option<DateTime<Utc>>,
        /// Skip occurrences at or before this time
        #[arg(long, value_parser = parse_instant_arg)]
        after: Option<DateTime<Utc>>,
    },

    /// Convert a phrase such as "every 2 days" to a repeating interval
    Iso {
        #[arg(required = true, num_args = 1..)]
        phrase: Vec<String>,
        /// Start of the interval
        #[arg(long, value_parser = parse_instant_arg)]
        from: Option<DateTime<Utc>>,
    },
}

fn parse_instant_arg(text: &str) -> Result<DateTime<Utc>, String> {
    parse_instant(text).ok_or_else(|| format!("'{text}' is not a date or RFC 3339 timestamp"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_logging(&cli.log_level, None)?;

    match cli.command {
        Command::Next { expression, from, after } => {
            let expression: ScheduleExpression = expression.parse()?;
            match expression.resolve(from, after)? {
                Some(next) => println!("{}", format_instant(next)),
                None => println!("none"),
            }
        }
        Command::Iso { phrase, from } => {
            println!("{}", relative_to_iso(&phrase.join(" "), from)?);
        }
        Command::Init => {
            let (pool, store) = connect(&cli.config_dir).await?;
            store.init().await.context("Failed to initialize jobs table")?;
            info!(table = %store.table().table, "Jobs table ready");
            pool.close().await;
        }
        Command::Schedule {
            queue,
            id,
            expression,
            data,
            preserve_run_at,
        } => {
            let data: serde_json::Value =
                serde_json::from_str(&data).context("--data is not valid JSON")?;
            let (pool, store) = connect(&cli.config_dir).await?;
            let scheduler = Scheduler::new(Arc::new(store));
            scheduler
                .schedule(&queue, &id, expression.as_str(), data, preserve_run_at)
                .await?;
            info!(queue = %queue, job_id = %id, "Job scheduled");
            pool.close().await;
        }
        Command::Remove { queue, id } => {
            let (pool, store) = connect(&cli.config_dir).await?;
            let scheduler = Scheduler::new(Arc::new(store));
            scheduler.remove(&queue, id.as_deref()).await?;
            pool.close().await;
        }
    }

    Ok(())
}

async fn connect(config_dir: &str) -> Result<(DbPool, PgJobStore)> {
    let settings = Settings::load_from_path(config_dir)
        .with_context(|| format!("Failed to load configuration from {config_dir}"))?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let pool = DbPool::new(&settings.database)
        .await
        .context("Database initialization error")?;
    pool.health_check().await.context("Database health check failed")?;
    let store = PgJobStore::new(pool.clone(), settings.store.table_ref());
    Ok((pool, store))
}
