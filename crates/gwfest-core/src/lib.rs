//! Core domain model, period parsing and listing identity for gwfest.

use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "gwfest-core";

const DATE_PATTERN: &str = r"(\d{4})[./-](\d{1,2})[./-](\d{1,2})";

static SINGLE_DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(DATE_PATTERN).expect("valid single date regex"));

static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"{DATE_PATTERN}\s*[~\-–]\s*{DATE_PATTERN}"))
        .expect("valid date range regex")
});

/// One anchor as scraped from the festival listing page, before reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    pub period: String,
    pub address: String,
    pub image_src: Option<String>,
    pub image_alt: Option<String>,
    pub detail_url: Option<String>,
}

/// Persisted festival row. `fingerprint` is the immutable identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FestivalListing {
    pub id: i64,
    pub title: String,
    pub period_raw: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub address: Option<String>,
    pub image_src: Option<String>,
    pub image_alt: Option<String>,
    pub detail_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one crawl run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlSummary {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
}

/// Normalized date range derived from a free-text period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl PeriodRange {
    pub const EMPTY: PeriodRange = PeriodRange {
        start: None,
        end: None,
    };

    fn single(date: NaiveDate) -> Self {
        Self {
            start: Some(date),
            end: Some(date),
        }
    }
}

/// One stop of a generated or saved itinerary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItineraryItem {
    pub index: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub description: String,
}

/// Parses listing period text such as `2025-08-19 ~ 2025-08-21` or `2025.08.29`.
///
/// A range is tried first; otherwise the first date found anywhere in the text
/// is used for both ends. The two ends of a range are not validated against
/// each other. Digits that do not form a calendar date yield an empty range.
pub fn parse_period(period_raw: Option<&str>) -> PeriodRange {
    let Some(text) = period_raw.filter(|s| !s.is_empty()) else {
        return PeriodRange::EMPTY;
    };

    if let Some(caps) = RANGE_RE.captures(text) {
        return match (date_from_captures(&caps, 1), date_from_captures(&caps, 4)) {
            (Some(start), Some(end)) => PeriodRange {
                start: Some(start),
                end: Some(end),
            },
            _ => PeriodRange::EMPTY,
        };
    }

    SINGLE_DATE_RE
        .captures(text)
        .and_then(|caps| date_from_captures(&caps, 1))
        .map(PeriodRange::single)
        .unwrap_or(PeriodRange::EMPTY)
}

fn date_from_captures(caps: &Captures<'_>, first_group: usize) -> Option<NaiveDate> {
    let part = |offset: usize| caps.get(first_group + offset).map(|m| m.as_str());
    let year = part(0)?.parse::<i32>().ok()?;
    let month = part(1)?.parse::<u32>().ok()?;
    let day = part(2)?.parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Content hash identifying a listing: SHA-256 of `title|detail_url|period_raw`,
/// each part trimmed, as 64 lowercase hex chars.
pub fn fingerprint(title: &str, detail_url: Option<&str>, period_raw: Option<&str>) -> String {
    let key = format!(
        "{}|{}|{}",
        title.trim(),
        detail_url.unwrap_or_default().trim(),
        period_raw.unwrap_or_default().trim()
    );
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Patch-if-present merge for mutable text fields: an empty or absent incoming
/// value never erases what is stored.
pub fn merge_text(existing: Option<String>, incoming: Option<&str>) -> Option<String> {
    match incoming {
        Some(value) if !value.is_empty() => Some(value.to_string()),
        _ => existing,
    }
}

/// Maps empty strings to `None` for nullable columns.
pub fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_dash_range_with_tilde() {
        let range = parse_period(Some("2025-08-19 ~ 2025-08-21"));
        assert_eq!(range.start, Some(ymd(2025, 8, 19)));
        assert_eq!(range.end, Some(ymd(2025, 8, 21)));
    }

    #[test]
    fn parses_dotted_single_date() {
        let range = parse_period(Some("2025.08.29"));
        assert_eq!(range.start, Some(ymd(2025, 8, 29)));
        assert_eq!(range.end, Some(ymd(2025, 8, 29)));
    }

    #[test]
    fn parses_mixed_separators_and_en_dash() {
        let range = parse_period(Some("기간: 2025/9/1–2025.9.3 (예정)"));
        assert_eq!(range.start, Some(ymd(2025, 9, 1)));
        assert_eq!(range.end, Some(ymd(2025, 9, 3)));
    }

    #[test]
    fn range_ends_are_not_reordered() {
        let range = parse_period(Some("2025-09-10 - 2025-09-01"));
        assert_eq!(range.start, Some(ymd(2025, 9, 10)));
        assert_eq!(range.end, Some(ymd(2025, 9, 1)));
    }

    #[test]
    fn empty_and_garbage_yield_nothing() {
        assert_eq!(parse_period(None), PeriodRange::EMPTY);
        assert_eq!(parse_period(Some("")), PeriodRange::EMPTY);
        assert_eq!(parse_period(Some("garbage text")), PeriodRange::EMPTY);
    }

    #[test]
    fn impossible_calendar_dates_yield_nothing() {
        assert_eq!(parse_period(Some("2025-02-30")), PeriodRange::EMPTY);
        assert_eq!(parse_period(Some("2025-13-01 ~ 2025-12-31")), PeriodRange::EMPTY);
    }

    #[test]
    fn single_date_uses_first_match() {
        let range = parse_period(Some("2025.10.03 개막, 2025.10.05 폐막"));
        assert_eq!(range.start, Some(ymd(2025, 10, 3)));
        assert_eq!(range.end, Some(ymd(2025, 10, 3)));
    }

    #[test]
    fn fingerprint_is_stable_and_ignores_surrounding_whitespace() {
        let a = fingerprint("춘천마임축제", Some("https://x/1"), Some("2025-05-25"));
        let b = fingerprint("  춘천마임축제 ", Some(" https://x/1"), Some("2025-05-25\n"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_matches_known_digest() {
        assert_eq!(
            fingerprint(" a ", Some("b"), Some("c ")),
            "a52dd81bfd5e4e66d96b9f598382f6cbf8c5c3897654e6ae9055e03620fcf38e"
        );
        // missing parts hash as empty strings
        assert_eq!(
            fingerprint("", None, None),
            "565d240f5343e625ae579a4d45a770f1f02c6368b5ed4d06da4fbe6f47c28866"
        );
    }

    #[test]
    fn fingerprint_changes_with_each_key_field() {
        let base = fingerprint("t", Some("u"), Some("p"));
        assert_ne!(base, fingerprint("t2", Some("u"), Some("p")));
        assert_ne!(base, fingerprint("t", Some("u2"), Some("p")));
        assert_ne!(base, fingerprint("t", Some("u"), Some("p2")));
    }

    #[test]
    fn merge_keeps_existing_when_incoming_is_empty() {
        assert_eq!(merge_text(Some("X".into()), Some("")), Some("X".into()));
        assert_eq!(merge_text(Some("X".into()), None), Some("X".into()));
        assert_eq!(merge_text(Some("X".into()), Some("Y")), Some("Y".into()));
        assert_eq!(merge_text(None, Some("Y")), Some("Y".into()));
    }
}
