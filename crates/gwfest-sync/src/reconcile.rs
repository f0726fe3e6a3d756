use chrono::{DateTime, Utc};
use gwfest_core::{fingerprint, merge_text, non_empty, parse_period, RawListing};
use gwfest_storage::{FestivalPatch, FestivalStore, NewFestival, StoreError};
use sqlx::SqliteConnection;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

enum Outcome {
    Inserted,
    Updated,
}

/// Reconciles a batch of extracted rows against stored festivals in a single
/// transaction. Any error drops the transaction uncommitted.
pub async fn upsert_listings(
    store: &FestivalStore,
    rows: &[RawListing],
) -> Result<UpsertCounts, StoreError> {
    let now = Utc::now();
    let mut tx = store.begin().await?;
    let mut counts = UpsertCounts::default();

    for row in rows {
        match reconcile_row(&mut tx, row, now).await? {
            Outcome::Inserted => counts.inserted += 1,
            Outcome::Updated => counts.updated += 1,
        }
    }

    tx.commit().await?;
    Ok(counts)
}

async fn reconcile_row(
    conn: &mut SqliteConnection,
    row: &RawListing,
    now: DateTime<Utc>,
) -> Result<Outcome, StoreError> {
    let title = row.title.trim();
    let detail_url = row.detail_url.as_deref().unwrap_or_default();
    let period_raw = row.period.as_str();

    let key = fingerprint(title, Some(detail_url), Some(period_raw));
    let period = parse_period(Some(period_raw));

    match FestivalStore::find_by_fingerprint(conn, &key).await? {
        Some(existing) => {
            let patch = FestivalPatch {
                title: merge_text(Some(existing.title), Some(title)).unwrap_or_default(),
                period_raw: merge_text(existing.period_raw, Some(period_raw)),
                period_start: period.start,
                period_end: period.end,
                address: merge_text(existing.address, Some(&row.address)),
                image_src: merge_text(existing.image_src, row.image_src.as_deref()),
                image_alt: merge_text(existing.image_alt, row.image_alt.as_deref()),
                detail_url: merge_text(existing.detail_url, Some(detail_url)),
            };
            FestivalStore::update(conn, existing.id, &patch, now).await?;
            debug!(id = existing.id, fingerprint = %key, "festival updated");
            Ok(Outcome::Updated)
        }
        None => {
            let festival = NewFestival {
                title: title.to_string(),
                period_raw: non_empty(Some(period_raw)),
                period_start: period.start,
                period_end: period.end,
                address: non_empty(Some(&row.address)),
                image_src: non_empty(row.image_src.as_deref()),
                image_alt: non_empty(row.image_alt.as_deref()),
                detail_url: non_empty(Some(detail_url)),
                fingerprint: key,
            };
            let id = FestivalStore::insert(conn, &festival, now).await?;
            debug!(id, fingerprint = %festival.fingerprint, "festival inserted");
            Ok(Outcome::Inserted)
        }
    }
}
