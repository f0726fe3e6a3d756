//! Listing source contracts + the Gangwon festival list page extractor.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use gwfest_core::RawListing;
use gwfest_storage::{FetchError, HttpFetcher};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gwfest-adapters";

pub const GANGWON_LIST_URL: &str = "https://www.gangwon.to/gwtour/now/festival";

static CONTAINER: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.now-list.list-type-col4.clearfix").expect("container selector"));
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").expect("anchor selector"));
static IMAGE: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("img selector"));
static TEXT_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".text strong").expect("title selector"));
static STRONG: Lazy<Selector> = Lazy::new(|| Selector::parse("strong").expect("strong selector"));
static TIME: Lazy<Selector> = Lazy::new(|| Selector::parse("time").expect("time selector"));
static SPAN: Lazy<Selector> = Lazy::new(|| Selector::parse("span").expect("span selector"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid listing url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A place listings are pulled from. Implementations fetch once per call and
/// never retry.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_listings(&self, run_id: Uuid) -> Result<Vec<RawListing>, AdapterError>;
}

/// Live festival list page on gangwon.to.
#[derive(Debug, Clone)]
pub struct GangwonListingSource {
    http: HttpFetcher,
    list_url: Url,
}

impl GangwonListingSource {
    pub fn new(http: HttpFetcher, list_url: &str) -> Result<Self, AdapterError> {
        let list_url = Url::parse(list_url).map_err(|source| AdapterError::InvalidUrl {
            url: list_url.to_string(),
            source,
        })?;
        Ok(Self { http, list_url })
    }

    pub fn list_url(&self) -> &Url {
        &self.list_url
    }
}

#[async_trait]
impl ListingSource for GangwonListingSource {
    fn source_id(&self) -> &'static str {
        "gangwon"
    }

    async fn fetch_listings(&self, run_id: Uuid) -> Result<Vec<RawListing>, AdapterError> {
        let page = self.http.fetch_text(run_id, self.list_url.as_str()).await?;
        if page.final_url != self.list_url {
            debug!(%run_id, final_url = %page.final_url, "list page was redirected");
        }
        // Relative links on the page are relative to where it was served from.
        Ok(parse_listing_page(&page.body, &page.final_url))
    }
}

/// Offline source that replays a saved list page from disk.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    path: PathBuf,
    base_url: Url,
}

impl FixtureListingSource {
    pub fn new(path: impl Into<PathBuf>, base_url: &str) -> Result<Self, AdapterError> {
        let base_url = Url::parse(base_url).map_err(|source| AdapterError::InvalidUrl {
            url: base_url.to_string(),
            source,
        })?;
        Ok(Self {
            path: path.into(),
            base_url,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &'static str {
        "gangwon-fixture"
    }

    async fn fetch_listings(&self, run_id: Uuid) -> Result<Vec<RawListing>, AdapterError> {
        let html = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading listing fixture {}", self.path.display()))?;
        debug!(%run_id, path = %self.path.display(), "replaying listing fixture");
        Ok(parse_listing_page(&html, &self.base_url))
    }
}

/// Extracts one [`RawListing`] per `a[href]` inside the festival list
/// container, in document order. A page without the container yields nothing.
pub fn parse_listing_page(html: &str, base_url: &Url) -> Vec<RawListing> {
    let document = Html::parse_document(html);
    let Some(container) = document.select(&CONTAINER).next() else {
        warn!(base_url = %base_url, "festival list container not found");
        return Vec::new();
    };

    container
        .select(&ANCHOR)
        .map(|anchor| listing_from_anchor(anchor, base_url))
        .collect()
}

fn listing_from_anchor(anchor: ElementRef<'_>, base_url: &Url) -> RawListing {
    let href = anchor.value().attr("href").unwrap_or_default().trim();
    let detail_url = resolve(base_url, href);

    let image = anchor.select(&IMAGE).next();
    let image_src = image
        .and_then(|img| img.value().attr("src"))
        .map(str::trim)
        .filter(|src| !src.is_empty())
        .and_then(|src| resolve(base_url, src));
    let image_alt = image
        .and_then(|img| img.value().attr("alt"))
        .map(str::trim)
        .filter(|alt| !alt.is_empty())
        .map(ToString::to_string);

    let title = anchor
        .select(&TEXT_TITLE)
        .next()
        .or_else(|| anchor.select(&STRONG).next())
        .map(|el| joined_text(el, ""))
        .unwrap_or_default();

    let period = anchor
        .select(&TIME)
        .next()
        .map(|el| joined_text(el, ""))
        .unwrap_or_default();

    let address = anchor
        .select(&SPAN)
        .filter(|span| span.select(&TIME).next().is_none())
        .map(|span| joined_text(span, " "))
        .find(|text| !text.is_empty())
        .unwrap_or_default();

    RawListing {
        title,
        period,
        address,
        image_src,
        image_alt,
        detail_url,
    }
}

fn resolve(base_url: &Url, reference: &str) -> Option<String> {
    base_url.join(reference).ok().map(String::from)
}

fn joined_text(element: ElementRef<'_>, separator: &str) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use gwfest_storage::HttpClientConfig;
    use tokio::net::TcpListener;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_path() -> PathBuf {
        workspace_root().join("fixtures/gangwon/festival_list.html")
    }

    fn read_snapshot() -> Vec<RawListing> {
        let text = std::fs::read_to_string(workspace_root().join("fixtures/gangwon/snapshot.json"))
            .expect("read snapshot");
        serde_json::from_str(&text).expect("parse snapshot")
    }

    fn base() -> Url {
        Url::parse(GANGWON_LIST_URL).unwrap()
    }

    #[test]
    fn golden_json_snapshot_test_gangwon_list_page() {
        let html = std::fs::read_to_string(fixture_path()).unwrap();
        let listings = parse_listing_page(&html, &base());
        assert_eq!(listings, read_snapshot());
    }

    #[test]
    fn page_without_container_yields_no_listings() {
        let html = r#"<html><body><div class="now-list"><a href="/x">x</a></div></body></html>"#;
        assert!(parse_listing_page(html, &base()).is_empty());
    }

    #[test]
    fn anchor_without_children_keeps_defaults() {
        let html = r#"
            <div class="now-list list-type-col4 clearfix">
              <a href="">빈 항목</a>
              <span>not inside an anchor</span>
            </div>"#;
        let listings = parse_listing_page(html, &base());
        assert_eq!(listings.len(), 1);
        let only = &listings[0];
        assert_eq!(only.title, "");
        assert_eq!(only.period, "");
        assert_eq!(only.address, "");
        assert_eq!(only.image_src, None);
        assert_eq!(only.image_alt, None);
        assert_eq!(only.detail_url.as_deref(), Some(GANGWON_LIST_URL));
    }

    #[test]
    fn address_is_first_non_empty_span_without_time() {
        let html = r#"
            <div class="now-list list-type-col4 clearfix">
              <a href="/v?id=1">
                <span><time>2025-01-01</time></span>
                <span> </span>
                <span>첫 주소</span>
                <span>둘째 주소</span>
              </a>
            </div>"#;
        let listings = parse_listing_page(html, &base());
        assert_eq!(listings[0].address, "첫 주소");
        assert_eq!(listings[0].period, "2025-01-01");
    }

    #[tokio::test]
    async fn fixture_source_replays_saved_page() {
        let source = FixtureListingSource::new(fixture_path(), GANGWON_LIST_URL).unwrap();
        let listings = source.fetch_listings(Uuid::new_v4()).await.unwrap();
        assert_eq!(listings.len(), 3);
        assert_eq!(source.source_id(), "gangwon-fixture");
    }

    #[tokio::test]
    async fn fixture_source_missing_file_is_an_error() {
        let source = FixtureListingSource::new("/nonexistent/list.html", GANGWON_LIST_URL).unwrap();
        let err = source.fetch_listings(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Anyhow(_)));
    }

    #[tokio::test]
    async fn gangwon_source_fetches_and_resolves_against_list_url() {
        let html = std::fs::read_to_string(fixture_path()).unwrap();
        let router = Router::new().route(
            "/gwtour/now/festival",
            get(move || {
                let html = html.clone();
                async move { axum::response::Html(html) }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let list_url = format!("http://{addr}/gwtour/now/festival");
        let source = GangwonListingSource::new(http, &list_url).unwrap();
        let listings = source.fetch_listings(Uuid::new_v4()).await.unwrap();

        assert_eq!(listings.len(), 3);
        assert_eq!(
            listings[0].detail_url.as_deref(),
            Some(format!("http://{addr}/gwtour/now/festival/view?id=101").as_str())
        );
        assert_eq!(
            listings[1].detail_url.as_deref(),
            Some("https://www.gangwon.to/gwtour/now/festival/view?id=102")
        );
    }

    #[tokio::test]
    async fn gangwon_source_resolves_links_against_redirected_url() {
        let html = std::fs::read_to_string(fixture_path()).unwrap();
        let router = Router::new()
            .route(
                "/festival",
                get(|| async { axum::response::Redirect::permanent("/gwtour/now/festival/") }),
            )
            .route(
                "/gwtour/now/festival/",
                get(move || {
                    let html = html.clone();
                    async move { axum::response::Html(html) }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let source = GangwonListingSource::new(http, &format!("http://{addr}/festival")).unwrap();
        let listings = source.fetch_listings(Uuid::new_v4()).await.unwrap();

        assert_eq!(listings.len(), 3);
        assert_eq!(
            listings[2].detail_url.as_deref(),
            Some(format!("http://{addr}/gwtour/now/festival/view?id=103").as_str())
        );
        assert_eq!(
            listings[0].image_src.as_deref(),
            Some(format!("http://{addr}/upload/festival/101.jpg").as_str())
        );
    }

    #[tokio::test]
    async fn gangwon_source_propagates_http_errors() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new()).await.unwrap();
        });

        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let source = GangwonListingSource::new(http, &format!("http://{addr}/missing")).unwrap();
        let err = source.fetch_listings(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::Fetch(FetchError::HttpStatus { status: 404, .. })
        ));
    }

    #[test]
    fn invalid_list_url_is_rejected() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        assert!(matches!(
            GangwonListingSource::new(http, "not a url"),
            Err(AdapterError::InvalidUrl { .. })
        ));
    }
}
