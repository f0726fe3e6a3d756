//! Prompt assembly and model-output recovery.

use gwfest_core::ItineraryItem;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::request::Budget;

pub const MAX_PROMPT_PLACES: usize = 20;

/// Nearby candidate surfaced by a places search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub name: String,
    pub address: String,
    pub category: Vec<String>,
    pub rating: Option<f64>,
    pub lat: f64,
    pub lng: f64,
    pub operating_hours: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TravelNeeds {
    /// KST RFC 3339.
    pub start_at: String,
    pub end_at: String,
    pub categories: Vec<String>,
    pub budget: Budget,
}

pub fn build_prompt(
    festival_title: &str,
    festival_location: &str,
    needs: &TravelNeeds,
    places: &[Place],
) -> String {
    let place_lines: Vec<String> = places
        .iter()
        .take(MAX_PROMPT_PLACES)
        .map(|place| {
            let categories = place.category.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
            let rating = place
                .rating
                .map(|r| r.to_string())
                .unwrap_or_else(|| "정보 없음".to_string());
            format!("- {} | {} | 평점:{} | {}", place.name, categories, rating, place.address)
        })
        .collect();
    let places_block = if place_lines.is_empty() {
        "(근처 후보 없음)".to_string()
    } else {
        place_lines.join("\n")
    };

    let example = json!({
        "itinerary": [
            {
                "index": 1,
                "type": "festival",
                "title": festival_title,
                "start_time": "2025-08-19T10:00:00+09:00",
                "end_time": "2025-08-19T11:30:00+09:00",
                "description": "행사장 중심 활동"
            },
            {
                "index": 2,
                "type": "place",
                "title": "소양강 스카이워크",
                "start_time": "2025-08-19T11:30:00+09:00",
                "end_time": "2025-08-19T12:00:00+09:00",
                "description": "주변 추천지"
            }
        ],
        "totals": {"estimated_cost_krw": 0, "estimated_travel_time_minutes": 0}
    });
    let example = serde_json::to_string_pretty(&example).unwrap_or_default();

    format!(
        "역할: 여행 플래너\n\
         \n\
         입력 정보\n\
         - 행사명: {festival_title}\n\
         - 행사장(위도,경도): {festival_location}\n\
         - 여행 기간(시작~종료, KST ISO8601): {start_at} ~ {end_at}\n\
         - 추가 고려 옵션:\n  \
           - 최대 예산: {budget}\n  \
           - 희망 여행 컨셉(참고용): {categories}\n\
         \n\
         참고용 주변 장소(최대 {max_places}개)\n\
         {places_block}\n\
         \n\
         요구사항\n\
         1) 내부 자료와 웹 검색으로 주변 장소 후보를 찾고, 검증 가능한 대표 정보(명칭, 카테고리, 평판)를 근거로 선정할 것.\n\
         2) 행사는 일정 중 최소 1회 이상 포함할 것(type=\"festival\").\n\
         3) 이동 시간을 현실적으로 반영하되, 특정 이동수단이나 경로 최적화는 고려하지 말 것.\n\
         4) 예산 제약은 반드시 지키고, 희망 여행 컨셉은 참고만 할 것.\n\
         5) 숙소와 주차장은 고려하지 말 것.\n\
         6) 모든 시간은 KST ISO8601 형식으로 기입할 것(예: 2025-08-19T10:00:00+09:00).\n\
         7) 장소 유형(type)은 festival, place, cafe, restaurant 중 하나만 사용할 것.\n\
         8) 결과는 JSON만 출력하고 다른 설명은 넣지 말 것.\n\
         9) description에 출처와 URL은 넣지 말 것.\n\
         \n\
         출력 스키마 예시\n\
         {example}",
        start_at = needs.start_at,
        end_at = needs.end_at,
        budget = needs.budget.as_str(),
        categories = needs.categories.join(", "),
        max_places = MAX_PROMPT_PLACES,
    )
}

/// Recovers the JSON object from model text. The whole text is tried first,
/// then the span from the first `{` to the last `}`. Anything unrecoverable
/// becomes an empty itinerary.
pub fn parse_model_output(raw: &str) -> Value {
    let text = raw.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return value;
    }

    if let (Some(left), Some(right)) = (text.find('{'), text.rfind('}')) {
        if right > left {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[left..=right]) {
                return value;
            }
        }
    }

    warn!(chars = text.chars().count(), "model output carried no JSON object");
    json!({"itinerary": []})
}

/// Keeps items that have every required field, coerced to strings, sorted by
/// `index`. A missing description becomes empty.
pub fn normalize_itinerary(items: &[Value]) -> Vec<ItineraryItem> {
    let mut normalized: Vec<ItineraryItem> = items.iter().filter_map(item_from_value).collect();
    normalized.sort_by_key(|item| item.index);
    normalized
}

fn item_from_value(value: &Value) -> Option<ItineraryItem> {
    let index = match value.get("index")? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64))?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Some(ItineraryItem {
        index,
        kind: text_field(value, "type")?,
        title: text_field(value, "title")?,
        start_time: text_field(value, "start_time")?,
        end_time: text_field(value, "end_time")?,
        description: text_field(value, "description").unwrap_or_default(),
    })
}

fn text_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
