use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tally_core::Granularity;
use tally_pipeline::{maybe_build_scheduler, PipelineConfig, PullOrchestrator, PullRequest};
use tally_store::postgres::PgStore;

#[derive(Debug, Parser)]
#[command(name = "tally-cli")]
#[command(about = "Tally scheduling-metrics pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one pull for a tenant over a date range.
    Pull {
        #[arg(long)]
        tenant: String,
        /// Range start, YYYY-MM-DD.
        #[arg(long)]
        start: String,
        /// Range end, YYYY-MM-DD (inclusive).
        #[arg(long)]
        end: String,
        /// day | week | month | quarter | year
        #[arg(long, default_value = "month")]
        granularity: String,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Pull {
            tenant,
            start,
            end,
            granularity,
        } => {
            let granularity: Granularity = granularity
                .parse()
                .map_err(|e: String| anyhow!(e))?;
            let request = PullRequest::new(tenant, &start, &end, granularity)
                .context("validating date range")?;

            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            let orchestrator = PullOrchestrator::new(Arc::new(store), config.api_client()?);

            let report = orchestrator.run_pull(&request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            let orchestrator =
                Arc::new(PullOrchestrator::new(Arc::new(store), config.api_client()?));

            match maybe_build_scheduler(&config, orchestrator).await? {
                Some(mut scheduler) => {
                    scheduler.start().await.context("starting scheduler")?;
                    info!(cron = config.pull_cron, "scheduler running; ctrl-c to stop");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    scheduler.shutdown().await.context("stopping scheduler")?;
                }
                None => {
                    anyhow::bail!("scheduler disabled; set TALLY_SCHEDULER_ENABLED=1");
                }
            }
        }
    }

    Ok(())
}
