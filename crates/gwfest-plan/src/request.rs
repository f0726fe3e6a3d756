//! `itinerary_request_v1` wire schema and its KST-normalized command form.

use chrono::{DateTime, FixedOffset, TimeZone};
use chrono_tz::Tz;
use gwfest_core::ItineraryItem;
use gwfest_storage::NewPlanRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::json;
use url::Url;

static CLOCK_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{2}:\d{2}$").expect("clock time regex"));

pub const KST: Tz = chrono_tz::Asia::Seoul;

/// Converts any zone-aware instant to Asia/Seoul wall time.
pub fn to_kst<Z: TimeZone>(instant: &DateTime<Z>) -> DateTime<Tz> {
    instant.with_timezone(&KST)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "itinerary_request_v1")]
    ItineraryRequestV1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Budget {
    Low,
    #[default]
    Normal,
    High,
}

impl Budget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Budget::Low => "low",
            Budget::Normal => "normal",
            Budget::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub app: String,
    pub platform: String,
    pub version: String,
}

/// Timestamps must carry an offset; naive values fail deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub title: String,
    pub start_at: DateTime<FixedOffset>,
    pub end_at: DateTime<FixedOffset>,
    pub origin_address: String,
    pub destination_address: String,
    pub stay_minutes: i64,
    pub festival_id: i64,
    pub festival_title: String,
    #[serde(default)]
    pub festival_detail_url: Option<Url>,
    #[serde(default)]
    pub festival_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    #[serde(default)]
    pub budget: Budget,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub avoid_crowded: bool,
    #[serde(default, deserialize_with = "clock_time")]
    pub start_time: Option<String>,
    #[serde(default, deserialize_with = "clock_time")]
    pub end_time: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn clock_time<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(value) if !CLOCK_TIME.is_match(&value) => Err(de::Error::custom(format!(
            "expected HH:MM, got {value:?}"
        ))),
        other => Ok(other),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItineraryRequest {
    pub schema_data: SchemaVersion,
    pub client: ClientInfo,
    pub schedule: ScheduleInfo,
    pub options: PlanOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSchedule {
    pub title: String,
    pub start_at_kst: DateTime<Tz>,
    pub end_at_kst: DateTime<Tz>,
    pub origin_address: String,
    pub destination_address: String,
    pub stay_minutes: i64,
    pub festival_id: i64,
    pub festival_title: String,
    pub festival_detail_url: Option<String>,
    pub festival_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPreferences {
    pub budget: Budget,
    pub categories: Vec<String>,
    pub avoid_crowded: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub notes: String,
}

/// A validated request with every instant moved to KST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCommand {
    pub schedule: PlanSchedule,
    pub preferences: PlanPreferences,
    pub client_app: String,
    pub client_platform: String,
    pub client_version: String,
}

impl ItineraryRequest {
    pub fn to_command(&self) -> PlanCommand {
        let s = &self.schedule;
        let o = &self.options;
        PlanCommand {
            schedule: PlanSchedule {
                title: s.title.clone(),
                start_at_kst: to_kst(&s.start_at),
                end_at_kst: to_kst(&s.end_at),
                origin_address: s.origin_address.clone(),
                destination_address: s.destination_address.clone(),
                stay_minutes: s.stay_minutes,
                festival_id: s.festival_id,
                festival_title: s.festival_title.clone(),
                festival_detail_url: s.festival_detail_url.as_ref().map(Url::to_string),
                festival_address: s.festival_address.clone(),
            },
            preferences: PlanPreferences {
                budget: o.budget,
                categories: o.categories.clone(),
                avoid_crowded: o.avoid_crowded,
                start_time: o.start_time.clone(),
                end_time: o.end_time.clone(),
                notes: o.notes.clone().unwrap_or_default(),
            },
            client_app: self.client.app.clone(),
            client_platform: self.client.platform.clone(),
            client_version: self.client.version.clone(),
        }
    }
}

impl PlanCommand {
    pub fn to_new_plan_request(&self) -> NewPlanRequest {
        let s = &self.schedule;
        let p = &self.preferences;
        NewPlanRequest {
            client_app: self.client_app.clone(),
            client_platform: self.client_platform.clone(),
            client_version: self.client_version.clone(),
            schedule: json!({
                "title": s.title,
                "start_at": s.start_at_kst.to_rfc3339(),
                "end_at": s.end_at_kst.to_rfc3339(),
                "origin_address": s.origin_address,
                "destination_address": s.destination_address,
                "stay_minutes": s.stay_minutes,
                "festival_id": s.festival_id,
                "festival_title": s.festival_title,
                "festival_detail_url": s.festival_detail_url,
            }),
            options: json!({
                "budget": p.budget,
                "categories": p.categories,
                "avoid_crowded": p.avoid_crowded,
                "start_time": p.start_time,
                "end_time": p.end_time,
                "notes": p.notes,
            }),
        }
    }

    /// Festival name handed to the recommender; the schedule title stands in
    /// when the festival title is blank.
    pub fn festival_name(&self) -> &str {
        let title = self.schedule.festival_title.trim();
        if title.is_empty() {
            &self.schedule.title
        } else {
            title
        }
    }
}

/// Body of `POST /plan/save`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCommit {
    pub ticket: String,
    #[serde(default)]
    pub itinerary: Vec<CommitItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitItem {
    pub index: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: DateTime<FixedOffset>,
    #[serde(default)]
    pub description: String,
}

impl CommitItem {
    pub fn to_item(&self) -> ItineraryItem {
        ItineraryItem {
            index: self.index,
            kind: self.kind.clone(),
            title: self.title.clone(),
            start_time: self.start_time.to_rfc3339(),
            end_time: self.end_time.to_rfc3339(),
            description: self.description.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn sample_request() -> Value {
        serde_json::from_str(include_str!("../../../fixtures/plan/itinerary_request_v1.json")).unwrap()
    }

    #[test]
    fn sample_request_normalizes_to_kst() {
        let request: ItineraryRequest = serde_json::from_value(sample_request()).unwrap();
        let command = request.to_command();

        assert_eq!(
            command.schedule.start_at_kst.to_rfc3339(),
            "2025-08-19T10:00:00+09:00"
        );
        assert_eq!(command.schedule.end_at_kst.to_rfc3339(), "2025-08-19T18:00:00+09:00");
        assert_eq!(command.preferences.budget, Budget::Low);
        assert_eq!(command.preferences.notes, "");
        assert!(!command.preferences.avoid_crowded);
        assert_eq!(command.festival_name(), "양구 배꼽축제");

        let stored = command.to_new_plan_request();
        assert_eq!(stored.schedule["start_at"], "2025-08-19T10:00:00+09:00");
        assert_eq!(stored.options["budget"], "low");
        assert_eq!(stored.options["start_time"], "09:30");
        assert_eq!(stored.options["end_time"], Value::Null);
    }

    #[test]
    fn budget_defaults_to_normal() {
        let mut raw = sample_request();
        raw["options"] = json!({});
        let request: ItineraryRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.options.budget, Budget::Normal);
        assert!(request.options.categories.is_empty());
    }

    #[test]
    fn rejects_naive_timestamps_bad_clock_times_and_unknown_schema() {
        let mut naive = sample_request();
        naive["schedule"]["start_at"] = json!("2025-08-19T10:00:00");
        assert!(serde_json::from_value::<ItineraryRequest>(naive).is_err());

        let mut clock = sample_request();
        clock["options"]["end_time"] = json!("9:30");
        assert!(serde_json::from_value::<ItineraryRequest>(clock).is_err());

        let mut schema = sample_request();
        schema["schema_data"] = json!("itinerary_request_v2");
        assert!(serde_json::from_value::<ItineraryRequest>(schema).is_err());

        let mut budget = sample_request();
        budget["options"]["budget"] = json!("luxury");
        assert!(serde_json::from_value::<ItineraryRequest>(budget).is_err());
    }

    #[test]
    fn to_kst_keeps_the_instant() {
        let utc = Utc.with_ymd_and_hms(2025, 12, 31, 20, 30, 0).single().unwrap();
        let kst = to_kst(&utc);
        assert_eq!(kst.to_rfc3339(), "2026-01-01T05:30:00+09:00");
        assert_eq!(kst.with_timezone(&Utc), utc);
    }

    #[test]
    fn commit_items_keep_their_offsets() {
        let commit: PlanCommit = serde_json::from_value(json!({
            "ticket": "a.b",
            "itinerary": [{
                "index": 1,
                "type": "festival",
                "title": "양구 배꼽축제",
                "start_time": "2025-08-19T10:00:00+09:00",
                "end_time": "2025-08-19T11:30:00+09:00",
                "description": "행사장"
            }]
        }))
        .unwrap();
        let item = commit.itinerary[0].to_item();
        assert_eq!(item.kind, "festival");
        assert_eq!(item.end_time, "2025-08-19T11:30:00+09:00");
    }
}
