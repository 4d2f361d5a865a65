//! Ingestion engine: normalization, velocity, scoring, price positioning,
//! the per-source orchestrator, and the guarded scheduler.
//!
//! Everything here is strictly sequential by construction: sources, then
//! chunks, then items, one at a time. Errors are recovered as close to
//! their origin as possible and converted into counters; nothing past a
//! single item or a single source is allowed to fail the run.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use trendscout_adapters::SourceAdapter;
use trendscout_core::{
    is_known_category, CanonicalProduct, ConfidenceBand, IngestionRunResult, PriceLabel,
    PricePosition, PriceSnapshot, RawListing, RunStatus, ScoringInput, SourcePlatform,
    SourceResult, Trend, TrendDraft, TrendScore,
};
use trendscout_storage::TrendStore;
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendscout-engine";

// ---------------------------------------------------------------------------
// Configuration

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub registry_path: String,
    pub batch_size: usize,
    pub default_base_score: f64,
    pub fetch_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub cron_morning: String,
    pub cron_evening: String,
    pub startup_delay_secs: u64,
    pub user_agent: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            registry_path: std::env::var("TRENDSCOUT_SOURCES")
                .unwrap_or_else(|_| "sources.yaml".to_string()),
            batch_size: std::env::var("TRENDSCOUT_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(25),
            default_base_score: std::env::var("TRENDSCOUT_BASE_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50.0),
            fetch_timeout_secs: std::env::var("TRENDSCOUT_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("TRENDSCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cron_morning: std::env::var("TRENDSCOUT_CRON_MORNING")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            cron_evening: std::env::var("TRENDSCOUT_CRON_EVENING")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
            startup_delay_secs: std::env::var("TRENDSCOUT_STARTUP_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            user_agent: std::env::var("TRENDSCOUT_USER_AGENT")
                .unwrap_or_else(|_| "trendscout-bot/0.1".to_string()),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.batch_size,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub platform: SourcePlatform,
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub base_score: Option<f64>,
}

pub fn load_source_registry(path: impl AsRef<Path>) -> Result<SourceRegistry> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Normalizer

fn price_value(value: &JsonValue) -> Option<f64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|p| p.is_finite() && *p >= 0.0)
}

/// Validate and sanitize one raw listing. `None` is the rejection signal;
/// the orchestrator counts it as an item-level error.
pub fn normalize_listing(raw: &RawListing) -> Option<CanonicalProduct> {
    let external_id = raw
        .external_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let title = raw
        .title
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())?;
    let source = SourcePlatform::parse(raw.source.as_deref()?)?;
    let price = price_value(raw.price.as_ref()?)?;

    let category = match raw.category.as_deref().map(str::trim) {
        Some(c) if is_known_category(c) => c.to_string(),
        _ => "Other".to_string(),
    };
    let currency = match raw.currency.as_deref().map(str::trim) {
        Some(c) if !c.is_empty() => c.to_uppercase().chars().take(3).collect(),
        _ => "USD".to_string(),
    };

    Some(CanonicalProduct {
        external_id: external_id.to_string(),
        title: title.chars().take(500).collect(),
        source,
        price,
        currency,
        image_url: raw.image_url.clone(),
        product_url: raw.product_url.clone(),
        category,
    })
}

// ---------------------------------------------------------------------------
// Velocity calculator

/// Percent price change between the two most recent snapshots, most-recent
/// first. Undefined with fewer than two snapshots or a zero-priced older
/// snapshot; in that case the stored velocity is left untouched.
pub fn price_velocity(latest_first: &[PriceSnapshot]) -> Option<String> {
    let (current, previous) = match latest_first {
        [current, previous, ..] => (current, previous),
        _ => return None,
    };
    let current = current.price.trim().parse::<f64>().ok()?;
    let previous = previous.price.trim().parse::<f64>().ok()?;
    if previous == 0.0 {
        return None;
    }
    let velocity = (current - previous) / previous * 100.0;
    if !velocity.is_finite() {
        return None;
    }
    Some(format!("{velocity:.2}"))
}

// ---------------------------------------------------------------------------
// Trend scoring engine

/// Per-platform reliability multipliers. A fixed lookup table, not a
/// distribution; values are not required to sum to 1.
#[derive(Debug, Clone)]
pub struct SourceWeights {
    weights: Vec<(SourcePlatform, f64)>,
    default_weight: f64,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            weights: vec![
                (SourcePlatform::Aliexpress, 0.30),
                (SourcePlatform::Tiktok, 0.25),
                (SourcePlatform::Temu, 0.15),
                (SourcePlatform::Shopify, 0.15),
                (SourcePlatform::Onchain, 0.15),
            ],
            default_weight: 0.10,
        }
    }
}

impl SourceWeights {
    pub fn multiplier(&self, platform: Option<SourcePlatform>) -> f64 {
        platform
            .and_then(|p| {
                self.weights
                    .iter()
                    .find(|(candidate, _)| *candidate == p)
                    .map(|(_, weight)| *weight)
            })
            .unwrap_or(self.default_weight)
    }
}

/// Composite 0-100 score with a confidence band, from base score, source
/// reliability, and bounded price velocity.
pub fn calculate_trend_score(input: &ScoringInput) -> TrendScore {
    calculate_trend_score_with(&SourceWeights::default(), input)
}

pub fn calculate_trend_score_with(weights: &SourceWeights, input: &ScoringInput) -> TrendScore {
    let base = input
        .raw_score
        .filter(|s| s.is_finite())
        .map(|s| s.clamp(0.0, 100.0))
        .unwrap_or(50.0);
    let velocity = input
        .price_velocity
        .as_deref()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite());

    // a single volatile tick cannot dominate the score
    let velocity_contribution = velocity.map(|v| (v * 0.75).clamp(-15.0, 15.0)).unwrap_or(0.0);
    let source_contribution = base * weights.multiplier(input.source_platform) * 0.65;
    let raw = base * 0.55 + source_contribution + velocity_contribution;
    let score = raw.clamp(0.0, 100.0).round() as u8;

    let confidence = if input.snapshot_count >= 10 && velocity.is_some() {
        ConfidenceBand::High
    } else if input.snapshot_count >= 3 {
        ConfidenceBand::Medium
    } else {
        ConfidenceBand::Low
    };

    TrendScore { score, confidence }
}

// ---------------------------------------------------------------------------
// Price normalization engine

/// Position of the last price inside the observed range, oldest-to-newest
/// array order. Empty history and an unmoved range are both neutral (50).
pub fn normalize_prices(prices: &[f64]) -> PricePosition {
    let observed: Vec<f64> = prices.iter().copied().filter(|p| p.is_finite()).collect();
    let Some(&current) = observed.last() else {
        return PricePosition {
            percentile: 50,
            label: PriceLabel::Neutral,
        };
    };

    let min = observed.iter().copied().fold(f64::INFINITY, f64::min);
    let max = observed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let percentile = if max == min {
        50
    } else {
        (((current - min) / (max - min)) * 100.0).round().clamp(0.0, 100.0) as u8
    };

    let label = if percentile <= 30 {
        PriceLabel::Cheap
    } else if percentile >= 70 {
        PriceLabel::Expensive
    } else {
        PriceLabel::Neutral
    };

    PricePosition { percentile, label }
}

pub fn price_position(history_oldest_first: &[PriceSnapshot]) -> PricePosition {
    let prices: Vec<f64> = history_oldest_first
        .iter()
        .filter_map(|s| s.price.trim().parse::<f64>().ok())
        .collect();
    normalize_prices(&prices)
}

/// Read-path entry point: position the trend's current price within its
/// own persisted history.
pub async fn price_position_for_trend(
    store: &dyn TrendStore,
    trend_id: Uuid,
) -> Result<PricePosition> {
    let history = store.snapshots_for_trend(trend_id).await?;
    Ok(price_position(&history))
}

// ---------------------------------------------------------------------------
// Event bus

#[derive(Debug, Clone)]
pub enum TrendEvent {
    Discovered { trend: Trend },
}

/// Broadcast bus for "new trend discovered" notifications. Constructed once
/// and handed to the pipeline; consumers subscribe without the pipeline
/// knowing about them. Emitting with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct TrendEvents {
    tx: broadcast::Sender<TrendEvent>,
}

impl TrendEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrendEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TrendEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for TrendEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

// ---------------------------------------------------------------------------
// Ingestion orchestrator

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub fetch_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            fetch_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Clone)]
struct RegisteredSource {
    adapter: Arc<dyn SourceAdapter>,
    base_score: f64,
}

/// Drives fetch -> normalize -> dedup -> chunked persistence per source,
/// with per-item error isolation. Sources run sequentially in registration
/// order; no source's failure prevents subsequent sources from running.
pub struct IngestionPipeline {
    store: Arc<dyn TrendStore>,
    events: TrendEvents,
    config: PipelineConfig,
    sources: RwLock<Vec<RegisteredSource>>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn TrendStore>, events: TrendEvents, config: PipelineConfig) -> Self {
        Self {
            store,
            events,
            config,
            sources: RwLock::new(Vec::new()),
        }
    }

    /// Add a source at runtime. The per-source base score seeds new trends
    /// and anchors every recompute for that source's products.
    pub fn register_source(&self, adapter: Arc<dyn SourceAdapter>, base_score: f64) {
        self.sources.write().unwrap().push(RegisteredSource {
            adapter,
            base_score,
        });
    }

    pub fn events(&self) -> &TrendEvents {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn TrendStore> {
        &self.store
    }

    pub async fn run_ingestion(&self) -> IngestionRunResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let sources: Vec<RegisteredSource> = self.sources.read().unwrap().clone();
        info!(%run_id, sources = sources.len(), "starting ingestion run");

        let mut results = Vec::with_capacity(sources.len());
        for source in &sources {
            results.push(self.ingest_source(source).await);
        }

        let result = IngestionRunResult::from_sources(run_id, started_at, Utc::now(), results);
        info!(
            %run_id,
            fetched = result.fetched,
            upserted = result.upserted,
            new_trends = result.new_trends,
            errors = result.errors,
            "ingestion run finished"
        );
        result
    }

    async fn ingest_source(&self, source: &RegisteredSource) -> SourceResult {
        let platform = source.adapter.platform();
        let mut result = SourceResult::new(platform);

        let listings = match tokio::time::timeout(self.config.fetch_timeout, source.adapter.fetch())
            .await
        {
            Err(_) => {
                warn!(source = %platform, "source fetch timed out");
                result.errors += 1;
                return result;
            }
            Ok(Err(err)) => {
                warn!(source = %platform, error = %err, "source fetch failed");
                result.errors += 1;
                return result;
            }
            Ok(Ok(listings)) => listings,
        };
        result.fetched = listings.len();

        let mut products = Vec::with_capacity(listings.len());
        for raw in &listings {
            match normalize_listing(raw) {
                Some(product) => products.push(product),
                None => result.errors += 1,
            }
        }

        // within-batch dedup on source:externalId, first occurrence wins
        let mut seen = HashSet::new();
        products.retain(|p| seen.insert(format!("{}:{}", p.source, p.external_id)));

        for chunk in products.chunks(self.config.batch_size.max(1)) {
            for product in chunk {
                match self.process_product(product, source.base_score).await {
                    Ok(is_new) => {
                        result.upserted += 1;
                        if is_new {
                            result.new_trends += 1;
                        }
                    }
                    Err(err) => {
                        warn!(
                            source = %platform,
                            external_id = %product.external_id,
                            error = %err,
                            "item failed, continuing batch"
                        );
                        result.errors += 1;
                    }
                }
            }
        }

        result
    }

    /// Upsert, snapshot, then recompute velocity and score. Four independent
    /// persistence calls with no atomic envelope; a crash between steps can
    /// leave the score one observation behind, which the next run repairs.
    async fn process_product(&self, product: &CanonicalProduct, base_score: f64) -> Result<bool> {
        let draft = TrendDraft {
            external_id: product.external_id.clone(),
            source_platform: product.source,
            name: product.title.clone(),
            category: product.category.clone(),
            image_url: product.image_url.clone(),
            product_url: product.product_url.clone(),
            trend_score: base_score.clamp(0.0, 100.0).round() as u8,
        };
        let (trend, is_new) = self
            .store
            .upsert_trend(&draft)
            .await
            .context("upserting trend")?;
        if is_new {
            info!(
                source = %trend.source_platform,
                external_id = %trend.external_id,
                name = %trend.name,
                "new trend discovered"
            );
            self.events.emit(TrendEvent::Discovered {
                trend: trend.clone(),
            });
        }

        self.store
            .create_price_snapshot(
                trend.id,
                product.source,
                &format!("{:.2}", product.price),
                Utc::now(),
            )
            .await
            .context("appending price snapshot")?;

        let recent = self
            .store
            .last_two_snapshots(trend.id)
            .await
            .context("loading recent snapshots")?;
        let velocity = price_velocity(&recent);
        if let Some(v) = &velocity {
            self.store
                .update_trend_velocity(trend.id, v)
                .await
                .context("updating velocity")?;
        }

        let snapshot_count = self
            .store
            .snapshot_count(trend.id)
            .await
            .context("counting snapshots")?;
        let scored = calculate_trend_score(&ScoringInput {
            raw_score: Some(base_score),
            price_velocity: velocity.or_else(|| trend.price_velocity.clone()),
            source_platform: Some(product.source),
            snapshot_count,
        });
        self.store
            .update_trend_score(trend.id, scored.score)
            .await
            .context("updating score")?;

        Ok(is_new)
    }
}

// ---------------------------------------------------------------------------
// Scheduler

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub cron_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Completed(IngestionRunResult),
    /// A run was already in progress; nothing was queued.
    Skipped,
}

/// Single-run guard around the pipeline. Cron firings and manual triggers
/// share [`IngestScheduler::trigger`]; at most one ingestion run executes
/// at a time process-wide.
pub struct IngestScheduler {
    pipeline: Arc<IngestionPipeline>,
    running: AtomicBool,
    cron_active: AtomicBool,
    last_run_at: RwLock<Option<DateTime<Utc>>>,
}

struct RunFlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunFlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl IngestScheduler {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            pipeline,
            running: AtomicBool::new(false),
            cron_active: AtomicBool::new(false),
            last_run_at: RwLock::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub async fn trigger(&self) -> TriggerOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("ingestion already running, skipping trigger");
            return TriggerOutcome::Skipped;
        }
        // cleared on every exit path, including panic inside the run
        let _flag = RunFlagGuard {
            flag: &self.running,
        };

        let started_at = Utc::now();
        let pipeline = Arc::clone(&self.pipeline);
        let result = match tokio::spawn(async move { pipeline.run_ingestion().await }).await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "ingestion run aborted before completion");
                IngestionRunResult::failed(Uuid::new_v4(), started_at)
            }
        };

        if result.status == RunStatus::Completed {
            *self.last_run_at.write().unwrap() = Some(Utc::now());
        }
        TriggerOutcome::Completed(result)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            is_running: self.running.load(Ordering::SeqCst),
            last_run_at: *self.last_run_at.read().unwrap(),
            cron_active: self.cron_active.load(Ordering::SeqCst),
        }
    }

    /// Start the two daily cron firings (UTC) plus a one-shot startup
    /// trigger so empty deployments self-populate.
    pub async fn start_cron(self: Arc<Self>, config: &EngineConfig) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [config.cron_morning.clone(), config.cron_evening.clone()] {
            let scheduler = Arc::clone(&self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
                let scheduler = Arc::clone(&scheduler);
                Box::pin(async move {
                    run_scheduled(scheduler).await;
                })
            })
            .with_context(|| format!("creating ingestion job for cron {cron}"))?;
            sched.add(job).await.context("adding ingestion job")?;
        }
        sched.start().await.context("starting scheduler")?;
        self.cron_active.store(true, Ordering::SeqCst);

        let scheduler = Arc::clone(&self);
        let delay = Duration::from_secs(config.startup_delay_secs);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            run_scheduled(scheduler).await;
        });

        Ok(sched)
    }
}

async fn run_scheduled(scheduler: Arc<IngestScheduler>) {
    match scheduler.trigger().await {
        TriggerOutcome::Completed(result) => info!(
            run_id = %result.run_id,
            status = ?result.status,
            upserted = result.upserted,
            new_trends = result.new_trends,
            errors = result.errors,
            "scheduled ingestion finished"
        ),
        TriggerOutcome::Skipped => info!("scheduled ingestion skipped, run in progress"),
    }
}
