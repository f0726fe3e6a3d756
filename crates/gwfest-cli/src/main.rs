use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gwfest_adapters::FixtureListingSource;
use gwfest_plan::{PlanConfig, PlanService};
use gwfest_storage::FestivalStore;
use gwfest_sync::{maybe_build_scheduler, CrawlPipeline, SyncConfig};
use gwfest_web::{AppState, WebConfig};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "gwfest")]
#[command(about = "Gangwon festival crawler and trip planner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with the crawl scheduler.
    Serve,
    /// Crawl the festival list once and exit.
    Crawl {
        /// Read the list page from a saved HTML file instead of the network.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gwfest_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Crawl { fixture } => {
            let summary = match fixture {
                Some(path) => {
                    let config = SyncConfig::from_env().context("loading crawl configuration")?;
                    let source = FixtureListingSource::new(path, &config.list_url)?;
                    let store = open_store(&config).await?;
                    CrawlPipeline::new(Arc::new(source), store).run().await?
                }
                None => gwfest_sync::run_crawl_once_from_env().await?,
            };
            println!(
                "crawl complete: fetched={} inserted={} updated={}",
                summary.fetched, summary.inserted, summary.updated
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env().context("loading crawl configuration")?;
            open_store(&config).await?;
            println!("migrations applied to {}", config.database_url);
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<FestivalStore> {
    let store = FestivalStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    Ok(store)
}

async fn serve() -> Result<()> {
    let sync_config = SyncConfig::from_env().context("loading crawl configuration")?;
    let plan_config = PlanConfig::from_env().context("loading plan configuration")?;
    let web_config = WebConfig::from_env().context("loading web configuration")?;

    let store = open_store(&sync_config).await?;
    let plans = PlanService::from_config(&plan_config, store.pool().clone())?;
    let pipeline = Arc::new(CrawlPipeline::from_config(&sync_config, store)?);

    let scheduler = maybe_build_scheduler(&sync_config, pipeline.clone())
        .await
        .context("building crawl scheduler")?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting crawl scheduler")?;
        info!(jobs = ?scheduler.job_ids().await, "crawl scheduler started");
    }

    let served = gwfest_web::serve(&web_config, AppState::new(pipeline, plans), shutdown_signal()).await;

    if let Some(scheduler) = &scheduler {
        scheduler.stop().await;
        info!("crawl scheduler stopped");
    }
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
