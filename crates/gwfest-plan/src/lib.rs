//! Travel plan generation around a festival: request normalization, model
//! recommendation, signed tickets, and saved itineraries.

mod prompt;
mod recommend;
mod request;
mod ticket;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use gwfest_core::ItineraryItem;
use gwfest_storage::{PlanStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{info, warn};

pub use prompt::{build_prompt, normalize_itinerary, parse_model_output, Place, TravelNeeds, MAX_PROMPT_PLACES};
pub use recommend::{
    output_text, GooglePlacesClient, ItineraryRecommender, OpenAiResponsesClient, PlacesLlmRecommender,
    RecommendationInput,
};
pub use request::{
    to_kst, Budget, ClientInfo, CommitItem, ItineraryRequest, PlanCommand, PlanCommit, PlanOptions,
    PlanPreferences, PlanSchedule, ScheduleInfo, SchemaVersion, KST,
};
pub use ticket::{TicketError, TicketPayload, TicketSigner};

pub const CRATE_NAME: &str = "gwfest-plan";

const DEV_SECRET_KEY: &str = "gwfest-dev-secret";

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Ticket(#[from] TicketError),
    #[error("itinerary is empty")]
    EmptyItinerary,
    #[error("plan {0} not found")]
    UnknownPlan(i64),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("{service} request failed: {source}")]
    Upstream {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned status {status}")]
    UpstreamStatus { service: &'static str, status: u16 },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
}

#[derive(Clone)]
pub struct PlanConfig {
    pub secret_key: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_endpoint: Option<String>,
    pub google_api_key: Option<String>,
    pub places_language: String,
    pub places_base_url: Option<String>,
    pub http_timeout_secs: u64,
}

impl std::fmt::Debug for PlanConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanConfig")
            .field("openai_api_key", &self.openai_api_key.is_some())
            .field("openai_model", &self.openai_model)
            .field("google_api_key", &self.google_api_key.is_some())
            .field("places_language", &self.places_language)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish_non_exhaustive()
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            secret_key: DEV_SECRET_KEY.to_string(),
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            openai_endpoint: None,
            google_api_key: None,
            places_language: "ko".to_string(),
            places_base_url: None,
            http_timeout_secs: 60,
        }
    }
}

impl PlanConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;

        let defaults = Self::default();
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let secret_key = var("SECRET_KEY").unwrap_or_else(|| {
            warn!("SECRET_KEY not set; signing plan tickets with the development key");
            defaults.secret_key.clone()
        });
        let http_timeout_secs = match var("GWFEST_PLAN_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("GWFEST_PLAN_TIMEOUT_SECS must be seconds, got {raw:?}"))?,
            None => defaults.http_timeout_secs,
        };

        Ok(Self {
            secret_key,
            openai_api_key: var("OPENAI_API_KEY"),
            openai_model: var("OPENAI_MODEL").unwrap_or(defaults.openai_model),
            openai_endpoint: var("OPENAI_RESPONSES_URL"),
            google_api_key: var("GOOGLE_API_KEY"),
            places_language: var("PLACES_LANGUAGE").unwrap_or(defaults.places_language),
            places_base_url: var("GOOGLE_PLACES_BASE_URL"),
            http_timeout_secs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    pub title: String,
    pub start_at_kst: String,
    pub end_at_kst: String,
    pub stay_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionsSummary {
    pub budget: Budget,
    pub categories: Vec<String>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanResult {
    pub plan_id: i64,
    pub schedule: ScheduleSummary,
    pub options: OptionsSummary,
    pub itinerary: Vec<ItineraryItem>,
    pub ticket: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EchoMeta {
    pub received_at_iso: DateTime<Utc>,
    pub echo: bool,
}

/// Body returned by `POST /plan/generate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItineraryResponse {
    pub ok: bool,
    pub meta: EchoMeta,
    pub request: ItineraryRequest,
    pub result: PlanResult,
}

impl ItineraryResponse {
    pub fn new(request: ItineraryRequest, result: PlanResult, received_at: DateTime<Utc>) -> Self {
        Self {
            ok: true,
            meta: EchoMeta {
                received_at_iso: received_at,
                echo: true,
            },
            request,
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedPlan {
    pub id: i64,
    pub saved_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PlanService {
    store: PlanStore,
    recommender: Arc<dyn ItineraryRecommender>,
    signer: TicketSigner,
}

impl PlanService {
    pub fn new(store: PlanStore, recommender: Arc<dyn ItineraryRecommender>, signer: TicketSigner) -> Self {
        Self {
            store,
            recommender,
            signer,
        }
    }

    pub fn from_config(config: &PlanConfig, pool: SqlitePool) -> anyhow::Result<Self> {
        let recommender = PlacesLlmRecommender::from_config(config)?;
        Ok(Self::new(
            PlanStore::new(pool),
            Arc::new(recommender),
            TicketSigner::new(&config.secret_key),
        ))
    }

    pub fn store(&self) -> &PlanStore {
        &self.store
    }

    /// Persists the request, asks the recommender for an itinerary, and signs
    /// a ticket for the new plan id. The request row survives a recommender
    /// failure.
    pub async fn generate(&self, request: &ItineraryRequest) -> Result<PlanResult, PlanError> {
        let command = request.to_command();
        let now = Utc::now();
        let plan_id = self.store.insert_request(&command.to_new_plan_request(), now).await?;
        info!(plan_id, festival = command.festival_name(), "plan request stored");

        let schedule = &command.schedule;
        let preferences = &command.preferences;
        let input = RecommendationInput {
            festival_title: command.festival_name().to_string(),
            festival_location_text: schedule
                .festival_address
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
            needs: TravelNeeds {
                start_at: schedule.start_at_kst.to_rfc3339(),
                end_at: schedule.end_at_kst.to_rfc3339(),
                categories: preferences.categories.clone(),
                budget: preferences.budget,
            },
        };

        let raw = self.recommender.recommend(&input).await?;
        let parsed = parse_model_output(&raw);
        let itinerary = parsed
            .get("itinerary")
            .and_then(Value::as_array)
            .map(|items| normalize_itinerary(items))
            .unwrap_or_default();
        info!(plan_id, items = itinerary.len(), "itinerary generated");

        let ticket = self.signer.sign(&TicketPayload {
            plan_id,
            issued_at: now,
        })?;

        Ok(PlanResult {
            plan_id,
            schedule: ScheduleSummary {
                title: schedule.title.clone(),
                start_at_kst: schedule.start_at_kst.to_rfc3339(),
                end_at_kst: schedule.end_at_kst.to_rfc3339(),
                stay_minutes: schedule.stay_minutes,
            },
            options: OptionsSummary {
                budget: preferences.budget,
                categories: preferences.categories.clone(),
                notes: preferences.notes.clone(),
            },
            itinerary,
            ticket,
        })
    }

    /// Stores a client-confirmed itinerary under the plan named by its ticket.
    pub async fn save(&self, commit: &PlanCommit) -> Result<SavedPlan, PlanError> {
        let payload: TicketPayload = self.signer.verify(&commit.ticket)?;
        if commit.itinerary.is_empty() {
            return Err(PlanError::EmptyItinerary);
        }
        if !self.store.request_exists(payload.plan_id).await? {
            return Err(PlanError::UnknownPlan(payload.plan_id));
        }

        let items: Vec<ItineraryItem> = commit.itinerary.iter().map(CommitItem::to_item).collect();
        let saved_at = Utc::now();
        let stored = self.store.insert_items(payload.plan_id, &items, saved_at).await?;
        info!(plan_id = payload.plan_id, items = stored, "itinerary saved");

        Ok(SavedPlan {
            id: payload.plan_id,
            saved_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gwfest_storage::FestivalStore;
    use serde_json::json;
    use std::sync::Mutex;

    struct CannedRecommender {
        reply: Result<String, u16>,
        seen: Mutex<Vec<RecommendationInput>>,
    }

    impl CannedRecommender {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(status: u16) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(status),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ItineraryRecommender for CannedRecommender {
        async fn recommend(&self, input: &RecommendationInput) -> Result<String, PlanError> {
            self.seen.lock().unwrap().push(input.clone());
            self.reply
                .clone()
                .map_err(|status| PlanError::UpstreamStatus { service: "llm", status })
        }
    }

    fn sample_request() -> ItineraryRequest {
        serde_json::from_str(include_str!("../../../fixtures/plan/itinerary_request_v1.json")).unwrap()
    }

    async fn service(recommender: Arc<CannedRecommender>) -> PlanService {
        let festivals = FestivalStore::in_memory().await.unwrap();
        festivals.migrate().await.unwrap();
        PlanService::new(
            PlanStore::new(festivals.pool().clone()),
            recommender,
            TicketSigner::new("test-secret"),
        )
    }

    const MODEL_REPLY: &str = r#"일정입니다
{"itinerary": [
  {"index": 2, "type": "cafe", "title": "카페 소양", "start_time": "2025-08-19T12:00:00+09:00", "end_time": "2025-08-19T13:00:00+09:00"},
  {"index": 1, "type": "festival", "title": "양구 배꼽축제", "start_time": "2025-08-19T10:00:00+09:00", "end_time": "2025-08-19T12:00:00+09:00", "description": "메인 행사"},
  {"index": 3, "type": "place", "start_time": "x", "end_time": "y"}
]}"#;

    #[tokio::test]
    async fn generate_persists_request_and_signs_ticket() {
        let recommender = CannedRecommender::replying(MODEL_REPLY);
        let service = service(recommender.clone()).await;

        let result = service.generate(&sample_request()).await.unwrap();
        assert!(service.store().request_exists(result.plan_id).await.unwrap());
        assert_eq!(result.schedule.start_at_kst, "2025-08-19T10:00:00+09:00");
        assert_eq!(result.options.budget, Budget::Low);

        let titles: Vec<&str> = result.itinerary.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["양구 배꼽축제", "카페 소양"]);

        let payload: TicketPayload = TicketSigner::new("test-secret").verify(&result.ticket).unwrap();
        assert_eq!(payload.plan_id, result.plan_id);

        let seen = recommender.seen.lock().unwrap();
        assert_eq!(seen[0].festival_title, "양구 배꼽축제");
        assert_eq!(
            seen[0].festival_location_text.as_deref(),
            Some("강원특별자치도 양구군 양구읍")
        );
        assert_eq!(seen[0].needs.categories, vec!["카페", "자연경관"]);
    }

    #[tokio::test]
    async fn garbage_model_output_yields_empty_itinerary() {
        let service = service(CannedRecommender::replying("no json here")).await;
        let result = service.generate(&sample_request()).await.unwrap();
        assert!(result.itinerary.is_empty());
    }

    #[tokio::test]
    async fn recommender_failure_keeps_request_row() {
        let service = service(CannedRecommender::failing(503)).await;
        let err = service.generate(&sample_request()).await.unwrap_err();
        assert!(matches!(err, PlanError::UpstreamStatus { status: 503, .. }));
        assert!(service.store().request_exists(1).await.unwrap());
    }

    #[tokio::test]
    async fn save_stores_items_under_ticket_plan() {
        let service = service(CannedRecommender::replying(MODEL_REPLY)).await;
        let generated = service.generate(&sample_request()).await.unwrap();

        let commit: PlanCommit = serde_json::from_value(json!({
            "ticket": generated.ticket,
            "itinerary": generated.itinerary,
        }))
        .unwrap();
        let saved = service.save(&commit).await.unwrap();
        assert_eq!(saved.id, generated.plan_id);

        let stored = service.store().items_for(generated.plan_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].item.kind, "festival");
        assert_eq!(stored[1].item.start_time, "2025-08-19T12:00:00+09:00");
    }

    #[tokio::test]
    async fn save_rejects_bad_tickets_empty_itineraries_and_unknown_plans() {
        let service = service(CannedRecommender::replying(MODEL_REPLY)).await;
        let generated = service.generate(&sample_request()).await.unwrap();

        let empty = PlanCommit {
            ticket: generated.ticket.clone(),
            itinerary: vec![],
        };
        assert!(matches!(service.save(&empty).await, Err(PlanError::EmptyItinerary)));

        let item: CommitItem = serde_json::from_value(json!({
            "index": 1,
            "type": "festival",
            "title": "양구 배꼽축제",
            "start_time": "2025-08-19T10:00:00+09:00",
            "end_time": "2025-08-19T12:00:00+09:00"
        }))
        .unwrap();

        let forged = PlanCommit {
            ticket: TicketSigner::new("other").sign(&json!({"plan_id": 1})).unwrap(),
            itinerary: vec![item.clone()],
        };
        assert!(matches!(
            service.save(&forged).await,
            Err(PlanError::Ticket(TicketError::Signature))
        ));

        let unknown = PlanCommit {
            ticket: TicketSigner::new("test-secret")
                .sign(&TicketPayload {
                    plan_id: 999,
                    issued_at: Utc::now(),
                })
                .unwrap(),
            itinerary: vec![item],
        };
        assert!(matches!(service.save(&unknown).await, Err(PlanError::UnknownPlan(999))));
    }

    #[test]
    fn config_debug_hides_secrets() {
        let config = PlanConfig {
            openai_api_key: Some("sk-live".into()),
            ..PlanConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-live"));
        assert!(!rendered.contains(DEV_SECRET_KEY));
    }
}
