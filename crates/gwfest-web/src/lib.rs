//! Axum JSON API: health, on-demand crawl, festival first page, plan flow.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use gwfest_core::{CrawlSummary, FestivalListing};
use gwfest_plan::{ItineraryRequest, ItineraryResponse, PlanCommit, PlanError, PlanService, SavedPlan};
use gwfest_storage::{FestivalStore, FirstPageQuery, StoreError};
use gwfest_sync::{CrawlError, CrawlPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "gwfest-web";

pub const DEFAULT_FIRST_PAGE: u32 = 16;
pub const MAX_FIRST_PAGE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    pub port: u16,
    /// `*` allows any origin; anything else is an explicit allow-list.
    pub cors_allow_origins: Vec<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            cors_allow_origins: vec!["*".to_string()],
        }
    }
}

impl WebConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let port = match std::env::var("GWFEST_WEB_PORT") {
            Ok(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("GWFEST_WEB_PORT must be a port number, got {raw:?}"))?,
            Err(_) => defaults.port,
        };
        let cors_allow_origins = std::env::var("CORS_ALLOW_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_allow_origins);
        Ok(Self {
            port,
            cors_allow_origins,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<CrawlPipeline>,
    pub festivals: FestivalStore,
    pub plans: PlanService,
}

impl AppState {
    pub fn new(pipeline: Arc<CrawlPipeline>, plans: PlanService) -> Self {
        Self {
            festivals: pipeline.store().clone(),
            pipeline,
            plans,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Crawl(#[from] CrawlError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Crawl(CrawlError::Fetch(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Plan(PlanError::Ticket(_) | PlanError::EmptyItinerary) => StatusCode::BAD_REQUEST,
            ApiError::Plan(PlanError::UnknownPlan(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = self.to_string();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/crawl/run", get(crawl_run_handler).post(crawl_run_handler))
        .route("/festivals/first-page", get(first_page_handler))
        .route("/plan/generate", post(plan_generate_handler))
        .route("/plan/save", post(plan_save_handler))
        .with_state(Arc::new(state))
}

pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Binds, serves until `shutdown` resolves, then returns.
pub async fn serve<F>(config: &WebConfig, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = app(state).layer(cors_layer(&config.cors_allow_origins));
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "http server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server")?;
    info!("http server stopped");
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339(),
    }))
}

async fn crawl_run_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
) -> Result<Json<CrawlSummary>, ApiError> {
    info!(%method, "on-demand crawl requested");
    Ok(Json(state.pipeline.run().await?))
}

#[derive(Debug, Default, Deserialize)]
struct FirstPageParams {
    limit: Option<i64>,
    page: Option<i64>,
    q: Option<String>,
}

impl FirstPageParams {
    fn to_query(&self) -> FirstPageQuery {
        let limit = self
            .limit
            .unwrap_or(i64::from(DEFAULT_FIRST_PAGE))
            .clamp(1, i64::from(MAX_FIRST_PAGE));
        let page = self.page.unwrap_or(1).max(1);
        let offset = (page - 1).saturating_mul(limit);
        FirstPageQuery {
            title_contains: self.q.clone(),
            limit: limit as u32,
            offset: u32::try_from(offset).unwrap_or(u32::MAX),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodView {
    pub raw: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FestivalItem {
    pub id: i64,
    pub title: String,
    pub period: PeriodView,
    pub address: Option<String>,
    pub image_src: Option<String>,
    pub detail_url: Option<String>,
}

impl From<FestivalListing> for FestivalItem {
    fn from(f: FestivalListing) -> Self {
        Self {
            id: f.id,
            title: f.title,
            period: PeriodView {
                raw: f.period_raw,
                start: f.period_start,
                end: f.period_end,
            },
            address: f.address,
            image_src: f.image_src,
            detail_url: f.detail_url,
        }
    }
}

async fn first_page_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FirstPageParams>,
) -> Result<Json<Vec<FestivalItem>>, ApiError> {
    let rows = state.festivals.latest_per_detail_url(&params.to_query()).await?;
    Ok(Json(rows.into_iter().map(FestivalItem::from).collect()))
}

async fn plan_generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ItineraryRequest>,
) -> Result<Json<ItineraryResponse>, ApiError> {
    let received_at = Utc::now();
    info!(
        client = %request.client.app,
        festival_id = request.schedule.festival_id,
        "itinerary request received"
    );
    let result = state.plans.generate(&request).await?;
    Ok(Json(ItineraryResponse::new(request, result, received_at)))
}

async fn plan_save_handler(
    State(state): State<Arc<AppState>>,
    Json(commit): Json<PlanCommit>,
) -> Result<Json<SavedPlan>, ApiError> {
    Ok(Json(state.plans.save(&commit).await?))
}
