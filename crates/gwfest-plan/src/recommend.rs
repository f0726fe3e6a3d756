//! Itinerary recommendation: nearby places from a places API, itinerary text
//! from an LLM responses endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::prompt::{build_prompt, Place, TravelNeeds};
use crate::{PlanConfig, PlanError};

const DEFAULT_KEYWORDS: [&str; 9] = [
    "관광", "레저", "맛집", "자연경관", "체험", "카페", "식당", "박물관", "전시",
];
const UNKNOWN: &str = "정보 없음";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecommendationInput {
    pub festival_title: String,
    /// Free-text location resolved to coordinates before the nearby search.
    pub festival_location_text: Option<String>,
    pub needs: TravelNeeds,
}

/// Produces raw itinerary text (expected to contain a JSON object).
#[async_trait]
pub trait ItineraryRecommender: Send + Sync {
    async fn recommend(&self, input: &RecommendationInput) -> Result<String, PlanError>;
}

fn upstream(service: &'static str) -> impl FnOnce(reqwest::Error) -> PlanError {
    move |source| PlanError::Upstream { service, source }
}

#[derive(Debug, Clone)]
pub struct GooglePlacesClient {
    http: Client,
    api_key: String,
    language: String,
    base_url: String,
}

impl GooglePlacesClient {
    pub fn new(http: Client, api_key: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            language: language.into(),
            base_url: "https://maps.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, PlanError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .query(params)
            .query(&[("key", self.api_key.as_str()), ("language", self.language.as_str())])
            .send()
            .await
            .map_err(upstream("places"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PlanError::UpstreamStatus {
                service: "places",
                status: status.as_u16(),
            });
        }
        resp.json().await.map_err(upstream("places"))
    }

    pub async fn find_place_id(&self, text: &str) -> Result<Option<String>, PlanError> {
        let body = self
            .get_json(
                "/maps/api/place/findplacefromtext/json",
                &[("input", text), ("inputtype", "textquery"), ("fields", "place_id")],
            )
            .await?;
        Ok(body["candidates"][0]["place_id"].as_str().map(ToString::to_string))
    }

    /// `"lat,lng"` for a place id.
    pub async fn geocode_place_id(&self, place_id: &str) -> Result<Option<String>, PlanError> {
        let body = self
            .get_json("/maps/api/geocode/json", &[("place_id", place_id)])
            .await?;
        let location = &body["results"][0]["geometry"]["location"];
        Ok(match (location["lat"].as_f64(), location["lng"].as_f64()) {
            (Some(lat), Some(lng)) => Some(format!("{lat},{lng}")),
            _ => None,
        })
    }

    pub async fn coordinates_for(&self, text: &str) -> Result<Option<String>, PlanError> {
        match self.find_place_id(text).await? {
            Some(place_id) => self.geocode_place_id(&place_id).await,
            None => Ok(None),
        }
    }

    pub async fn place_details(&self, place_id: &str) -> Result<Value, PlanError> {
        let body = self
            .get_json(
                "/maps/api/place/details/json",
                &[
                    ("place_id", place_id),
                    ("fields", "name,formatted_address,rating,opening_hours,vicinity"),
                ],
            )
            .await?;
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn nearby_search(
        &self,
        location: &str,
        keyword: &str,
        radius_m: u32,
    ) -> Result<Vec<Value>, PlanError> {
        let radius = radius_m.to_string();
        let body = self
            .get_json(
                "/maps/api/place/nearbysearch/json",
                &[("location", location), ("keyword", keyword), ("radius", radius.as_str())],
            )
            .await?;
        Ok(body["results"].as_array().cloned().unwrap_or_default())
    }

    /// Nearby candidates for every keyword. A failing keyword or detail
    /// lookup is logged and skipped.
    pub async fn find_near_places(&self, location: &str, keywords: &[String], radius_m: u32) -> Vec<Place> {
        let mut places = Vec::new();
        for keyword in keywords {
            let results = match self.nearby_search(location, keyword, radius_m).await {
                Ok(results) => results,
                Err(err) => {
                    warn!(keyword = %keyword, error = %err, "nearby search failed");
                    continue;
                }
            };

            for result in &results {
                let details = match result["place_id"].as_str() {
                    Some(place_id) => self.place_details(place_id).await.unwrap_or_else(|err| {
                        warn!(place_id, error = %err, "place details failed");
                        Value::Null
                    }),
                    None => Value::Null,
                };
                if let Some(place) = place_from_result(result, &details) {
                    places.push(place);
                }
            }
        }
        debug!(count = places.len(), "nearby places collected");
        places
    }
}

fn place_from_result(result: &Value, details: &Value) -> Option<Place> {
    let location = &result["geometry"]["location"];
    let (lat, lng) = (location["lat"].as_f64()?, location["lng"].as_f64()?);

    let text = |primary: &Value, fallback: &Value| {
        primary
            .as_str()
            .or_else(|| fallback.as_str())
            .unwrap_or(UNKNOWN)
            .to_string()
    };
    let strings = |value: &Value| -> Option<Vec<String>> {
        let list: Vec<String> = value
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect();
        (!list.is_empty()).then_some(list)
    };

    Some(Place {
        name: text(&details["name"], &result["name"]),
        address: text(&details["formatted_address"], &result["vicinity"]),
        category: strings(&result["types"]).unwrap_or_else(|| vec![UNKNOWN.to_string()]),
        rating: details["rating"].as_f64().or_else(|| result["rating"].as_f64()),
        lat,
        lng,
        operating_hours: strings(&details["opening_hours"]["weekday_text"])
            .unwrap_or_else(|| vec![UNKNOWN.to_string()]),
    })
}

#[derive(Debug, Clone)]
pub struct OpenAiResponsesClient {
    http: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAiResponsesClient {
    pub fn new(http: Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            endpoint: "https://api.openai.com/v1/responses".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// One responses call with web search enabled; returns the output text.
    pub async fn create_response(&self, input: &str) -> Result<String, PlanError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "tools": [{"type": "web_search_preview"}],
                "input": input,
            }))
            .send()
            .await
            .map_err(upstream("llm"))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PlanError::UpstreamStatus {
                service: "llm",
                status: status.as_u16(),
            });
        }
        let body: Value = resp.json().await.map_err(upstream("llm"))?;
        Ok(output_text(&body).unwrap_or_else(|| body.to_string()))
    }
}

/// Concatenated `output_text` parts of a responses payload.
pub fn output_text(body: &Value) -> Option<String> {
    if let Some(text) = body["output_text"].as_str() {
        return Some(text.to_string());
    }
    let text: String = body["output"]
        .as_array()?
        .iter()
        .filter_map(|item| item["content"].as_array())
        .flatten()
        .filter(|part| part["type"] == "output_text")
        .filter_map(|part| part["text"].as_str())
        .collect();
    (!text.is_empty()).then_some(text)
}

/// Places search feeding an LLM prompt. Without a places key the prompt is
/// built with no candidates; without an LLM key every call fails.
#[derive(Debug, Clone)]
pub struct PlacesLlmRecommender {
    places: Option<GooglePlacesClient>,
    llm: Option<OpenAiResponsesClient>,
    radius_km: u32,
}

impl PlacesLlmRecommender {
    pub fn new(places: Option<GooglePlacesClient>, llm: Option<OpenAiResponsesClient>) -> Self {
        Self {
            places,
            llm,
            radius_km: 10,
        }
    }

    pub fn from_config(config: &PlanConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .context("building recommender http client")?;

        let places = config.google_api_key.as_ref().map(|key| {
            let client = GooglePlacesClient::new(http.clone(), key.clone(), config.places_language.clone());
            match &config.places_base_url {
                Some(base_url) => client.with_base_url(base_url.clone()),
                None => client,
            }
        });
        if places.is_none() {
            warn!("GOOGLE_API_KEY not set; itineraries will be planned without nearby places");
        }
        let llm = config.openai_api_key.as_ref().map(|key| {
            let client = OpenAiResponsesClient::new(http.clone(), key.clone(), config.openai_model.clone());
            match &config.openai_endpoint {
                Some(endpoint) => client.with_endpoint(endpoint.clone()),
                None => client,
            }
        });
        if llm.is_none() {
            warn!("OPENAI_API_KEY not set; plan generation will fail");
        }
        Ok(Self::new(places, llm))
    }

    async fn nearby(&self, input: &RecommendationInput) -> (String, Vec<Place>) {
        let (Some(places), Some(text)) = (&self.places, input.festival_location_text.as_deref()) else {
            return (String::new(), Vec::new());
        };

        let location = match places.coordinates_for(text).await {
            Ok(Some(location)) => location,
            Ok(None) => return (String::new(), Vec::new()),
            Err(err) => {
                warn!(location = text, error = %err, "festival location lookup failed");
                return (String::new(), Vec::new());
            }
        };

        let keywords: Vec<String> = if input.needs.categories.is_empty() {
            DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect()
        } else {
            input.needs.categories.clone()
        };
        let radius_m = (self.radius_km * 1000).max(1000);
        let found = places.find_near_places(&location, &keywords, radius_m).await;
        (location, found)
    }
}

#[async_trait]
impl ItineraryRecommender for PlacesLlmRecommender {
    async fn recommend(&self, input: &RecommendationInput) -> Result<String, PlanError> {
        let llm = self.llm.as_ref().ok_or(PlanError::NotConfigured("OPENAI_API_KEY"))?;
        let (location, places) = self.nearby(input).await;
        let prompt = build_prompt(&input.festival_title, &location, &input.needs, &places);
        info!(
            festival = %input.festival_title,
            places = places.len(),
            "requesting itinerary from model"
        );
        llm.create_response(&prompt).await
    }
}
