//! Crawl orchestration: fetch the festival list, reconcile it into the store,
//! and keep doing so on a schedule.

mod reconcile;
mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveTime, Utc};
use chrono_tz::Tz;
use gwfest_adapters::{AdapterError, GangwonListingSource, ListingSource, GANGWON_LIST_URL};
use gwfest_core::CrawlSummary;
use gwfest_storage::{FestivalStore, HttpClientConfig, HttpFetcher, StoreError, DEFAULT_USER_AGENT};
use thiserror::Error;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub use reconcile::{upsert_listings, UpsertCounts};
pub use scheduler::{Admission, CrawlScheduler, FiringPolicy, SchedulerError, SchedulerState, Trigger};

pub const CRATE_NAME: &str = "gwfest-sync";

pub const DAILY_CRAWL_JOB: &str = "daily_crawl";
pub const INITIAL_CRAWL_JOB: &str = "initial_crawl";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub list_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub crawl_on_startup: bool,
    pub initial_crawl_delay_secs: u64,
    pub daily_crawl_at: NaiveTime,
    pub crawl_timezone: Tz,
    pub misfire_grace_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://data/app.db?mode=rwc".to_string(),
            list_url: GANGWON_LIST_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            scheduler_enabled: true,
            crawl_on_startup: true,
            initial_crawl_delay_secs: 5,
            daily_crawl_at: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            crawl_timezone: chrono_tz::Asia::Seoul,
            misfire_grace_secs: 600,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let daily_crawl_at = match std::env::var("DAILY_CRAWL_AT") {
            Ok(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M")
                .with_context(|| format!("DAILY_CRAWL_AT must be HH:MM, got {raw:?}"))?,
            Err(_) => defaults.daily_crawl_at,
        };
        let crawl_timezone = match std::env::var("CRAWL_TIMEZONE") {
            Ok(raw) => raw
                .trim()
                .parse::<Tz>()
                .map_err(|err| anyhow::anyhow!("CRAWL_TIMEZONE {raw:?}: {err}"))?,
            Err(_) => defaults.crawl_timezone,
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            list_url: std::env::var("GWFEST_LIST_URL").unwrap_or(defaults.list_url),
            user_agent: std::env::var("GWFEST_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_number("GWFEST_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: env_flag("GWFEST_SCHEDULER_ENABLED").unwrap_or(defaults.scheduler_enabled),
            crawl_on_startup: env_flag("CRAWL_ON_STARTUP").unwrap_or(defaults.crawl_on_startup),
            initial_crawl_delay_secs: env_number("INITIAL_CRAWL_DELAY_SECONDS")
                .unwrap_or(defaults.initial_crawl_delay_secs),
            daily_crawl_at,
            crawl_timezone,
            misfire_grace_secs: env_number("CRAWL_MISFIRE_GRACE_SECS").unwrap_or(defaults.misfire_grace_secs),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

fn env_number(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("fetching festival list failed: {0}")]
    Fetch(#[from] AdapterError),
    #[error("storing festivals failed: {0}")]
    Storage(#[from] StoreError),
}

/// One fetch, one extraction, one reconciliation batch. No retries.
#[derive(Clone)]
pub struct CrawlPipeline {
    source: Arc<dyn ListingSource>,
    store: FestivalStore,
}

impl CrawlPipeline {
    pub fn new(source: Arc<dyn ListingSource>, store: FestivalStore) -> Self {
        Self { source, store }
    }

    /// Pipeline against the live list page described by `config`.
    pub fn from_config(config: &SyncConfig, store: FestivalStore) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let source = GangwonListingSource::new(http, &config.list_url)
            .with_context(|| format!("configuring listing source for {}", config.list_url))?;
        Ok(Self::new(Arc::new(source), store))
    }

    pub fn store(&self) -> &FestivalStore {
        &self.store
    }

    pub async fn run(&self) -> Result<CrawlSummary, CrawlError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("crawl_run", %run_id, source = self.source.source_id());
        self.run_with_id(run_id).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid) -> Result<CrawlSummary, CrawlError> {
        let started_at = Utc::now();
        let rows = self.source.fetch_listings(run_id).await?;
        let counts = upsert_listings(&self.store, &rows).await?;
        let summary = CrawlSummary {
            fetched: rows.len(),
            inserted: counts.inserted,
            updated: counts.updated,
        };
        info!(
            fetched = summary.fetched,
            inserted = summary.inserted,
            updated = summary.updated,
            elapsed_ms = (Utc::now() - started_at).num_milliseconds(),
            "crawl finished"
        );
        Ok(summary)
    }
}

async fn run_crawl_job(job_id: &'static str, pipeline: Arc<CrawlPipeline>) {
    match pipeline.run().await {
        Ok(summary) => info!(
            job_id,
            fetched = summary.fetched,
            inserted = summary.inserted,
            updated = summary.updated,
            "scheduled crawl completed"
        ),
        Err(err) => error!(job_id, error = %err, "scheduled crawl failed"),
    }
}

/// Registers the daily crawl and, when enabled, the delayed startup crawl.
/// Returns `None` when scheduling is switched off.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<CrawlPipeline>,
) -> Result<Option<CrawlScheduler>, SchedulerError> {
    if !config.scheduler_enabled {
        info!("crawl scheduler disabled");
        return Ok(None);
    }

    let scheduler = CrawlScheduler::new().await?;
    let policy = FiringPolicy {
        misfire_grace: Some(Duration::from_secs(config.misfire_grace_secs)),
    };

    {
        let pipeline = pipeline.clone();
        scheduler
            .add_job(
                DAILY_CRAWL_JOB,
                Trigger::Daily {
                    at: config.daily_crawl_at,
                    tz: config.crawl_timezone,
                },
                policy,
                move || run_crawl_job(DAILY_CRAWL_JOB, pipeline.clone()),
            )
            .await?;
    }

    if config.crawl_on_startup {
        let at = Utc::now() + chrono::Duration::seconds(config.initial_crawl_delay_secs as i64);
        scheduler
            .add_job(INITIAL_CRAWL_JOB, Trigger::Once(at), policy, move || {
                run_crawl_job(INITIAL_CRAWL_JOB, pipeline.clone())
            })
            .await?;
    }

    Ok(Some(scheduler))
}

/// Connects, migrates and runs one crawl against the configured list page.
pub async fn run_crawl_once_from_env() -> Result<CrawlSummary> {
    let config = SyncConfig::from_env()?;
    let store = FestivalStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.migrate().await.context("running migrations")?;
    let pipeline = CrawlPipeline::from_config(&config, store)?;
    Ok(pipeline.run().await?)
}
