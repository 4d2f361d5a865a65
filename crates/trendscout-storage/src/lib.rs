//! Trend persistence contract + backends, and the retrying HTTP fetch
//! utility used by live marketplace adapters.
//!
//! The store surface is deliberately narrow: upsert by natural key,
//! append-only snapshots, and single-field velocity/score updates. There is
//! no cross-call transaction; the engine treats the four write steps of an
//! ingestion item as independent operations.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::debug;
use trendscout_core::{PriceSnapshot, SourcePlatform, Trend, TrendDraft};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendscout-storage";

/// Storage operations the ingestion engine depends on.
#[async_trait]
pub trait TrendStore: Send + Sync {
    /// Look up by `(external_id, source_platform)`. On a hit, update the
    /// display fields and score and return `is_new = false`; otherwise
    /// insert the full row and return `is_new = true`. `detected_at` is
    /// written once at insert and never touched again.
    async fn upsert_trend(&self, draft: &TrendDraft) -> Result<(Trend, bool)>;

    /// Append-only insert; snapshots are never mutated or deleted.
    async fn create_price_snapshot(
        &self,
        trend_id: Uuid,
        source: SourcePlatform,
        price: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<PriceSnapshot>;

    /// Most-recent-first, limit 2.
    async fn last_two_snapshots(&self, trend_id: Uuid) -> Result<Vec<PriceSnapshot>>;

    /// Full history, oldest first. Read path for price positioning.
    async fn snapshots_for_trend(&self, trend_id: Uuid) -> Result<Vec<PriceSnapshot>>;

    async fn update_trend_velocity(&self, trend_id: Uuid, velocity: &str) -> Result<()>;

    async fn update_trend_score(&self, trend_id: Uuid, score: u8) -> Result<()>;

    async fn snapshot_count(&self, trend_id: Uuid) -> Result<u64>;

    async fn get_trend(
        &self,
        external_id: &str,
        source_platform: SourcePlatform,
    ) -> Result<Option<Trend>>;
}

/// In-memory [`TrendStore`] used by tests and database-less deployments.
/// `HashMap` + `Vec` behind `std::sync::RwLock`; snapshot recording order
/// doubles as the time order.
pub struct InMemoryTrendStore {
    trends: RwLock<HashMap<(String, SourcePlatform), Trend>>,
    snapshots: RwLock<Vec<PriceSnapshot>>,
}

impl InMemoryTrendStore {
    pub fn new() -> Self {
        Self {
            trends: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(Vec::new()),
        }
    }

    pub fn trend_count(&self) -> usize {
        self.trends.read().unwrap().len()
    }
}

impl Default for InMemoryTrendStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrendStore for InMemoryTrendStore {
    async fn upsert_trend(&self, draft: &TrendDraft) -> Result<(Trend, bool)> {
        let key = (draft.external_id.clone(), draft.source_platform);
        let mut trends = self.trends.write().unwrap();
        if let Some(existing) = trends.get_mut(&key) {
            existing.name = draft.name.clone();
            existing.category = draft.category.clone();
            existing.image_url = draft.image_url.clone();
            existing.product_url = draft.product_url.clone();
            existing.trend_score = draft.trend_score;
            return Ok((existing.clone(), false));
        }
        let trend = Trend {
            id: Uuid::new_v4(),
            external_id: draft.external_id.clone(),
            source_platform: draft.source_platform,
            name: draft.name.clone(),
            category: draft.category.clone(),
            image_url: draft.image_url.clone(),
            product_url: draft.product_url.clone(),
            trend_score: draft.trend_score,
            price_velocity: None,
            detected_at: Utc::now(),
        };
        trends.insert(key, trend.clone());
        Ok((trend, true))
    }

    async fn create_price_snapshot(
        &self,
        trend_id: Uuid,
        source: SourcePlatform,
        price: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<PriceSnapshot> {
        let snapshot = PriceSnapshot {
            id: Uuid::new_v4(),
            trend_id,
            source,
            price: price.to_string(),
            recorded_at,
        };
        self.snapshots.write().unwrap().push(snapshot.clone());
        Ok(snapshot)
    }

    async fn last_two_snapshots(&self, trend_id: Uuid) -> Result<Vec<PriceSnapshot>> {
        let snapshots = self.snapshots.read().unwrap();
        // reversed scan yields most-recent-first
        Ok(snapshots
            .iter()
            .filter(|s| s.trend_id == trend_id)
            .rev()
            .take(2)
            .cloned()
            .collect())
    }

    async fn snapshots_for_trend(&self, trend_id: Uuid) -> Result<Vec<PriceSnapshot>> {
        let snapshots = self.snapshots.read().unwrap();
        Ok(snapshots
            .iter()
            .filter(|s| s.trend_id == trend_id)
            .cloned()
            .collect())
    }

    async fn update_trend_velocity(&self, trend_id: Uuid, velocity: &str) -> Result<()> {
        let mut trends = self.trends.write().unwrap();
        match trends.values_mut().find(|t| t.id == trend_id) {
            Some(trend) => {
                trend.price_velocity = Some(velocity.to_string());
                Ok(())
            }
            None => bail!("trend {trend_id} not found"),
        }
    }

    async fn update_trend_score(&self, trend_id: Uuid, score: u8) -> Result<()> {
        let mut trends = self.trends.write().unwrap();
        match trends.values_mut().find(|t| t.id == trend_id) {
            Some(trend) => {
                trend.trend_score = score;
                Ok(())
            }
            None => bail!("trend {trend_id} not found"),
        }
    }

    async fn snapshot_count(&self, trend_id: Uuid) -> Result<u64> {
        let snapshots = self.snapshots.read().unwrap();
        Ok(snapshots.iter().filter(|s| s.trend_id == trend_id).count() as u64)
    }

    async fn get_trend(
        &self,
        external_id: &str,
        source_platform: SourcePlatform,
    ) -> Result<Option<Trend>> {
        let trends = self.trends.read().unwrap();
        Ok(trends
            .get(&(external_id.to_string(), source_platform))
            .cloned())
    }
}

/// Postgres-backed [`TrendStore`] using runtime-checked sqlx queries.
pub struct PgTrendStore {
    pool: PgPool,
}

impl PgTrendStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    /// Idempotent bootstrap of the two tables this crate owns.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trends (
                id UUID PRIMARY KEY,
                external_id TEXT NOT NULL,
                source_platform TEXT NOT NULL,
                name TEXT NOT NULL,
                category TEXT NOT NULL,
                image_url TEXT,
                product_url TEXT,
                trend_score SMALLINT NOT NULL,
                price_velocity TEXT,
                detected_at TIMESTAMPTZ NOT NULL,
                UNIQUE (external_id, source_platform)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating trends table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_snapshots (
                id UUID PRIMARY KEY,
                trend_id UUID NOT NULL REFERENCES trends(id),
                source TEXT NOT NULL,
                price TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating price_snapshots table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_price_snapshots_trend \
             ON price_snapshots (trend_id, recorded_at)",
        )
        .execute(&self.pool)
        .await
        .context("creating snapshot index")?;

        Ok(())
    }
}

fn trend_from_row(row: &PgRow) -> Result<Trend> {
    let platform_tag: String = row.try_get("source_platform")?;
    let source_platform = SourcePlatform::parse(&platform_tag)
        .with_context(|| format!("unknown source_platform tag {platform_tag:?} in trends row"))?;
    let score: i16 = row.try_get("trend_score")?;
    Ok(Trend {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        source_platform,
        name: row.try_get("name")?,
        category: row.try_get("category")?,
        image_url: row.try_get("image_url")?,
        product_url: row.try_get("product_url")?,
        trend_score: score.clamp(0, 100) as u8,
        price_velocity: row.try_get("price_velocity")?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<PriceSnapshot> {
    let source_tag: String = row.try_get("source")?;
    let source = SourcePlatform::parse(&source_tag)
        .with_context(|| format!("unknown source tag {source_tag:?} in price_snapshots row"))?;
    Ok(PriceSnapshot {
        id: row.try_get("id")?,
        trend_id: row.try_get("trend_id")?,
        source,
        price: row.try_get("price")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

#[async_trait]
impl TrendStore for PgTrendStore {
    async fn upsert_trend(&self, draft: &TrendDraft) -> Result<(Trend, bool)> {
        let row = sqlx::query(
            r#"
            INSERT INTO trends
                (id, external_id, source_platform, name, category,
                 image_url, product_url, trend_score, price_velocity, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9)
            ON CONFLICT (external_id, source_platform) DO UPDATE SET
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                image_url = EXCLUDED.image_url,
                product_url = EXCLUDED.product_url,
                trend_score = EXCLUDED.trend_score
            RETURNING id, external_id, source_platform, name, category,
                      image_url, product_url, trend_score, price_velocity,
                      detected_at, (xmax = 0) AS is_new
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&draft.external_id)
        .bind(draft.source_platform.as_str())
        .bind(&draft.name)
        .bind(&draft.category)
        .bind(&draft.image_url)
        .bind(&draft.product_url)
        .bind(draft.trend_score as i16)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("upserting trend")?;

        let is_new: bool = row.try_get("is_new")?;
        Ok((trend_from_row(&row)?, is_new))
    }

    async fn create_price_snapshot(
        &self,
        trend_id: Uuid,
        source: SourcePlatform,
        price: &str,
        recorded_at: DateTime<Utc>,
    ) -> Result<PriceSnapshot> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO price_snapshots (id, trend_id, source, price, recorded_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(id)
        .bind(trend_id)
        .bind(source.as_str())
        .bind(price)
        .bind(recorded_at)
        .execute(&self.pool)
        .await
        .context("inserting price snapshot")?;
        Ok(PriceSnapshot {
            id,
            trend_id,
            source,
            price: price.to_string(),
            recorded_at,
        })
    }

    async fn last_two_snapshots(&self, trend_id: Uuid) -> Result<Vec<PriceSnapshot>> {
        let rows = sqlx::query(
            "SELECT id, trend_id, source, price, recorded_at FROM price_snapshots \
             WHERE trend_id = $1 ORDER BY recorded_at DESC LIMIT 2",
        )
        .bind(trend_id)
        .fetch_all(&self.pool)
        .await
        .context("loading recent snapshots")?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn snapshots_for_trend(&self, trend_id: Uuid) -> Result<Vec<PriceSnapshot>> {
        let rows = sqlx::query(
            "SELECT id, trend_id, source, price, recorded_at FROM price_snapshots \
             WHERE trend_id = $1 ORDER BY recorded_at ASC",
        )
        .bind(trend_id)
        .fetch_all(&self.pool)
        .await
        .context("loading snapshot history")?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn update_trend_velocity(&self, trend_id: Uuid, velocity: &str) -> Result<()> {
        let updated = sqlx::query("UPDATE trends SET price_velocity = $2 WHERE id = $1")
            .bind(trend_id)
            .bind(velocity)
            .execute(&self.pool)
            .await
            .context("updating trend velocity")?;
        if updated.rows_affected() == 0 {
            bail!("trend {trend_id} not found");
        }
        Ok(())
    }

    async fn update_trend_score(&self, trend_id: Uuid, score: u8) -> Result<()> {
        let updated = sqlx::query("UPDATE trends SET trend_score = $2 WHERE id = $1")
            .bind(trend_id)
            .bind(score as i16)
            .execute(&self.pool)
            .await
            .context("updating trend score")?;
        if updated.rows_affected() == 0 {
            bail!("trend {trend_id} not found");
        }
        Ok(())
    }

    async fn snapshot_count(&self, trend_id: Uuid) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM price_snapshots WHERE trend_id = $1")
            .bind(trend_id)
            .fetch_one(&self.pool)
            .await
            .context("counting snapshots")?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn get_trend(
        &self,
        external_id: &str,
        source_platform: SourcePlatform,
    ) -> Result<Option<Trend>> {
        let row = sqlx::query(
            "SELECT id, external_id, source_platform, name, category, image_url, \
             product_url, trend_score, price_velocity, detected_at FROM trends \
             WHERE external_id = $1 AND source_platform = $2",
        )
        .bind(external_id)
        .bind(source_platform.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("loading trend by natural key")?;
        row.as_ref().map(trend_from_row).transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    Retryable,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> RetryClass {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryClass::Retryable
    } else {
        RetryClass::Fatal
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryClass {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryClass::Retryable
    } else {
        RetryClass::Fatal
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: "trendscout-bot/0.1".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Bounded-timeout, exponential-backoff GET client shared by the live
/// marketplace adapters. One hung endpoint never blocks past the timeout.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, source: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut last_transport_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.retry.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryClass::Retryable
                        && attempt < self.retry.max_retries
                    {
                        debug!(source, url, %status, attempt, "retrying after http status");
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryClass::Retryable
                        && attempt < self.retry.max_retries
                    {
                        debug!(source, url, error = %err, attempt, "retrying after transport error");
                        last_transport_error = Some(err);
                        tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Transport(err));
                }
            }
        }

        Err(FetchError::Transport(
            last_transport_error.expect("retry loop captures a transport error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(external_id: &str, score: u8) -> TrendDraft {
        TrendDraft {
            external_id: external_id.to_string(),
            source_platform: SourcePlatform::Aliexpress,
            name: format!("Widget {external_id}"),
            category: "Gadgets".to_string(),
            image_url: None,
            product_url: Some("https://example.com/widget".to_string()),
            trend_score: score,
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_natural_key() {
        let store = InMemoryTrendStore::new();
        let (first, is_new) = store.upsert_trend(&draft("w-1", 50)).await.unwrap();
        assert!(is_new);

        let (second, is_new) = store.upsert_trend(&draft("w-1", 72)).await.unwrap();
        assert!(!is_new);
        assert_eq!(store.trend_count(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(second.trend_score, 72);
        assert_eq!(second.detected_at, first.detected_at);
    }

    #[tokio::test]
    async fn distinct_platforms_do_not_collide() {
        let store = InMemoryTrendStore::new();
        store.upsert_trend(&draft("w-1", 50)).await.unwrap();
        let mut other = draft("w-1", 50);
        other.source_platform = SourcePlatform::Temu;
        let (_, is_new) = store.upsert_trend(&other).await.unwrap();
        assert!(is_new);
        assert_eq!(store.trend_count(), 2);
    }

    #[tokio::test]
    async fn last_two_snapshots_are_most_recent_first() {
        let store = InMemoryTrendStore::new();
        let (trend, _) = store.upsert_trend(&draft("w-1", 50)).await.unwrap();
        for price in ["10.00", "12.00", "8.00"] {
            store
                .create_price_snapshot(trend.id, trend.source_platform, price, Utc::now())
                .await
                .unwrap();
        }

        let recent = store.last_two_snapshots(trend.id).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].price, "8.00");
        assert_eq!(recent[1].price, "12.00");

        let history = store.snapshots_for_trend(trend.id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].price, "10.00");
        assert_eq!(store.snapshot_count(trend.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn velocity_update_targets_single_trend() {
        let store = InMemoryTrendStore::new();
        let (trend, _) = store.upsert_trend(&draft("w-1", 50)).await.unwrap();
        store.update_trend_velocity(trend.id, "-20.00").await.unwrap();

        let loaded = store
            .get_trend("w-1", SourcePlatform::Aliexpress)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.price_velocity.as_deref(), Some("-20.00"));
        assert!(store
            .update_trend_velocity(Uuid::new_v4(), "1.00")
            .await
            .is_err());
    }

    #[test]
    fn retry_delays_are_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }
}
