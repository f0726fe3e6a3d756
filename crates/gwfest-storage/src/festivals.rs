use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use gwfest_core::FestivalListing;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use tracing::info;

use crate::StoreError;

const FESTIVAL_COLUMNS: &str = "id, title, period_raw, period_start, period_end, address, \
image_src, image_alt, detail_url, published_at, fingerprint, created_at, updated_at";

/// Row to insert for a fingerprint seen for the first time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFestival {
    pub title: String,
    pub period_raw: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub address: Option<String>,
    pub image_src: Option<String>,
    pub image_alt: Option<String>,
    pub detail_url: Option<String>,
    pub fingerprint: String,
}

/// Full set of mutable values written back on a fingerprint match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FestivalPatch {
    pub title: String,
    pub period_raw: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub address: Option<String>,
    pub image_src: Option<String>,
    pub image_alt: Option<String>,
    pub detail_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirstPageQuery {
    pub title_contains: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct FestivalStore {
    pool: SqlitePool,
}

impl FestivalStore {
    /// Opens (creating if needed) the database at `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pooled connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// Starts the transaction a reconciliation batch runs in.
    ///
    /// The write lock is taken at `BEGIN`, so a second batch waits out the
    /// busy timeout instead of failing when it upgrades from a read.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM festival")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<FestivalListing>, StoreError> {
        let sql = format!("SELECT {FESTIVAL_COLUMNS} FROM festival WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| festival_from_row(&r)).transpose()
    }

    pub async fn find_by_fingerprint(
        conn: &mut SqliteConnection,
        fingerprint: &str,
    ) -> Result<Option<FestivalListing>, StoreError> {
        let sql = format!("SELECT {FESTIVAL_COLUMNS} FROM festival WHERE fingerprint = ?1");
        let row = sqlx::query(&sql)
            .bind(fingerprint)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(|r| festival_from_row(&r)).transpose()
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        festival: &NewFestival,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO festival (
                title, period_raw, period_start, period_end, address,
                image_src, image_alt, detail_url, published_at, fingerprint,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10, ?10)
            "#,
        )
        .bind(&festival.title)
        .bind(&festival.period_raw)
        .bind(festival.period_start)
        .bind(festival.period_end)
        .bind(&festival.address)
        .bind(&festival.image_src)
        .bind(&festival.image_alt)
        .bind(&festival.detail_url)
        .bind(&festival.fingerprint)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update(
        conn: &mut SqliteConnection,
        id: i64,
        patch: &FestivalPatch,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE festival
               SET title = ?1,
                   period_raw = ?2,
                   period_start = ?3,
                   period_end = ?4,
                   address = ?5,
                   image_src = ?6,
                   image_alt = ?7,
                   detail_url = ?8,
                   updated_at = ?9
             WHERE id = ?10
            "#,
        )
        .bind(&patch.title)
        .bind(&patch.period_raw)
        .bind(patch.period_start)
        .bind(patch.period_end)
        .bind(&patch.address)
        .bind(&patch.image_src)
        .bind(&patch.image_alt)
        .bind(&patch.detail_url)
        .bind(now)
        .bind(id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Newest snapshot per `detail_url`, dated listings first.
    pub async fn latest_per_detail_url(
        &self,
        query: &FirstPageQuery,
    ) -> Result<Vec<FestivalListing>, StoreError> {
        let title_filter = query
            .title_contains
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let sql = format!(
            r#"
            WITH ranked AS (
                SELECT {FESTIVAL_COLUMNS},
                       ROW_NUMBER() OVER (
                           PARTITION BY detail_url
                           ORDER BY created_at DESC, id DESC
                       ) AS snapshot_rank
                  FROM festival
                 WHERE detail_url IS NOT NULL
            )
            SELECT {FESTIVAL_COLUMNS}
              FROM ranked
             WHERE snapshot_rank = 1
               AND (?1 IS NULL OR instr(title, ?1) > 0)
             ORDER BY period_start IS NULL, period_start DESC, created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(title_filter)
            .bind(i64::from(query.limit))
            .bind(i64::from(query.offset))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(festival_from_row).collect()
    }
}

fn festival_from_row(row: &SqliteRow) -> Result<FestivalListing, StoreError> {
    Ok(FestivalListing {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        period_raw: row.try_get("period_raw")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        address: row.try_get("address")?,
        image_src: row.try_get("image_src")?,
        image_alt: row.try_get("image_alt")?,
        detail_url: row.try_get("detail_url")?,
        published_at: row.try_get("published_at")?,
        fingerprint: row.try_get("fingerprint")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
