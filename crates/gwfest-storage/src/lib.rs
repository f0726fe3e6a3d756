//! SQLite record stores + the listing page HTTP fetcher for gwfest.

use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod festivals;
mod plans;

pub use festivals::{FestivalPatch, FestivalStore, FirstPageQuery, NewFestival};
pub use plans::{NewPlanRequest, PlanStore, StoredPlanItem};

pub const CRATE_NAME: &str = "gwfest-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("encoding json column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("preparing database directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Where the request ended up after redirects.
    pub final_url: reqwest::Url,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET with no retry; any non-2xx status is an error.
    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async move {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().clone();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url.to_string(),
                });
            }

            let body = resp.text().await?;
            debug!(bytes = body.len(), "fetched listing page");
            Ok(FetchedPage { final_url, body })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetch_text_returns_body_and_sends_user_agent() {
        let router = Router::new().route(
            "/festival",
            get(|headers: axum::http::HeaderMap| async move {
                headers
                    .get(axum::http::header::USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        );
        let base = serve(router).await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let page = fetcher
            .fetch_text(Uuid::new_v4(), &format!("{base}/festival"))
            .await
            .expect("fetch");
        assert_eq!(page.body, DEFAULT_USER_AGENT);
        assert!(page.final_url.path().ends_with("/festival"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let router = Router::new().route(
            "/gone",
            get(|| async { (StatusCode::NOT_FOUND, "missing") }),
        );
        let base = serve(router).await;

        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let err = fetcher
            .fetch_text(Uuid::new_v4(), &format!("{base}/gone"))
            .await
            .unwrap_err();
        match err {
            FetchError::HttpStatus { status, url } => {
                assert_eq!(status, 404);
                assert!(url.ends_with("/gone"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            user_agent: None,
        })
        .unwrap();
        // nothing listens on the loopback discard port
        let err = fetcher
            .fetch_text(Uuid::new_v4(), "http://127.0.0.1:9/")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
    }
}
