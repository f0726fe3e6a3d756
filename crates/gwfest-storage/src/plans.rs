use chrono::{DateTime, Utc};
use gwfest_core::ItineraryItem;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct NewPlanRequest {
    pub client_app: String,
    pub client_platform: String,
    pub client_version: String,
    pub schedule: JsonValue,
    pub options: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPlanItem {
    pub id: i64,
    pub plan_request_id: i64,
    pub item: ItineraryItem,
    pub created_at: DateTime<Utc>,
}

/// Passive persistence for plan requests and their saved itineraries.
#[derive(Debug, Clone)]
pub struct PlanStore {
    pool: SqlitePool,
}

impl PlanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_request(
        &self,
        request: &NewPlanRequest,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO plan_request (
                client_app, client_platform, client_version,
                schedule_json, options_json, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&request.client_app)
        .bind(&request.client_platform)
        .bind(&request.client_version)
        .bind(serde_json::to_string(&request.schedule)?)
        .bind(serde_json::to_string(&request.options)?)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn request_exists(&self, plan_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM plan_request WHERE id = ?1) AS found")
            .bind(plan_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<bool, _>("found")?)
    }

    pub async fn schedule_of(&self, plan_id: i64) -> Result<Option<JsonValue>, StoreError> {
        let row = sqlx::query("SELECT schedule_json FROM plan_request WHERE id = ?1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let text: String = row.try_get("schedule_json")?;
                Ok(Some(serde_json::from_str(&text)?))
            }
            None => Ok(None),
        }
    }

    /// Writes every item under `plan_id` in one transaction.
    pub async fn insert_items(
        &self,
        plan_id: i64,
        items: &[ItineraryItem],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r#"
                INSERT INTO plan_itinerary_item (
                    plan_request_id, "index", type, title,
                    start_time, end_time, description, created_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(plan_id)
            .bind(item.index)
            .bind(&item.kind)
            .bind(&item.title)
            .bind(&item.start_time)
            .bind(&item.end_time)
            .bind(&item.description)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(items.len())
    }

    pub async fn items_for(&self, plan_id: i64) -> Result<Vec<StoredPlanItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, plan_request_id, "index", type, title,
                   start_time, end_time, description, created_at
              FROM plan_itinerary_item
             WHERE plan_request_id = ?1
             ORDER BY "index", id
            "#,
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StoredPlanItem {
                    id: row.try_get("id")?,
                    plan_request_id: row.try_get("plan_request_id")?,
                    item: ItineraryItem {
                        index: row.try_get("index")?,
                        kind: row.try_get("type")?,
                        title: row.try_get("title")?,
                        start_time: row.try_get("start_time")?,
                        end_time: row.try_get("end_time")?,
                        description: row.try_get("description")?,
                    },
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
