//! Core domain model for Trendscout: canonical products, persisted trends,
//! price snapshots, and the ephemeral scoring/result types shared by the
//! adapters, storage, and engine crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendscout-core";

/// Marketplaces we ingest from. `Onchain` is a reserved slot for future
/// anchored listings; no adapter ships for it yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePlatform {
    Aliexpress,
    Tiktok,
    Temu,
    Shopify,
    Onchain,
}

impl SourcePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePlatform::Aliexpress => "aliexpress",
            SourcePlatform::Tiktok => "tiktok",
            SourcePlatform::Temu => "temu",
            SourcePlatform::Shopify => "shopify",
            SourcePlatform::Onchain => "onchain",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "aliexpress" => Some(SourcePlatform::Aliexpress),
            "tiktok" => Some(SourcePlatform::Tiktok),
            "temu" => Some(SourcePlatform::Temu),
            "shopify" => Some(SourcePlatform::Shopify),
            "onchain" => Some(SourcePlatform::Onchain),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourcePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed category vocabulary. Anything outside this set coerces to `"Other"`
/// during normalization instead of rejecting the listing.
pub const CATEGORIES: &[&str] = &[
    "Electronics",
    "Fashion",
    "Beauty",
    "Home & Kitchen",
    "Toys",
    "Sports",
    "Accessories",
    "Gadgets",
    "Other",
];

pub fn is_known_category(category: &str) -> bool {
    CATEGORIES.iter().any(|c| *c == category)
}

/// Loosely-typed listing candidate handed from a source adapter to the
/// normalizer. Every field is optional by construction; validation happens
/// in one place rather than per adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub source: Option<String>,
    pub price: Option<JsonValue>,
    pub currency: Option<String>,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub category: Option<String>,
}

/// Normalized, source-agnostic product produced fresh on every fetch.
/// Never persisted directly; the orchestrator turns it into a [`Trend`]
/// upsert plus a [`PriceSnapshot`] append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub external_id: String,
    pub title: String,
    pub source: SourcePlatform,
    pub price: f64,
    pub currency: String,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub category: String,
}

/// Persisted product entity tracked across ingestion runs. Identity is the
/// `(external_id, source_platform)` pair; that pair is never duplicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub id: Uuid,
    pub external_id: String,
    pub source_platform: SourcePlatform,
    pub name: String,
    pub category: String,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub trend_score: u8,
    pub price_velocity: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Write-side input for the trend upsert. On an existing row only the
/// display fields and score are applied; `detected_at` stays untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendDraft {
    pub external_id: String,
    pub source_platform: SourcePlatform,
    pub name: String,
    pub category: String,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub trend_score: u8,
}

/// Append-only price observation. `price` is a string-encoded decimal so a
/// round trip through storage never loses precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: Uuid,
    pub trend_id: Uuid,
    pub source: SourcePlatform,
    pub price: String,
    pub recorded_at: DateTime<Utc>,
}

/// Input to the trend scoring engine. Ephemeral, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringInput {
    pub raw_score: Option<f64>,
    pub price_velocity: Option<String>,
    pub source_platform: Option<SourcePlatform>,
    pub snapshot_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    Low,
    Medium,
    High,
}

impl ConfidenceBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::Low => "low",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::High => "high",
        }
    }
}

/// Composite score plus the confidence band backing it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendScore {
    pub score: u8,
    pub confidence: ConfidenceBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceLabel {
    Cheap,
    Neutral,
    Expensive,
}

/// Where the current price sits inside the trend's own observed range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePosition {
    pub percentile: u8,
    pub label: PriceLabel,
}

/// Per-source ingestion counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source: SourcePlatform,
    pub fetched: usize,
    pub upserted: usize,
    pub new_trends: usize,
    pub errors: usize,
}

impl SourceResult {
    pub fn new(source: SourcePlatform) -> Self {
        Self {
            source,
            fetched: 0,
            upserted: 0,
            new_trends: 0,
            errors: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Aggregate result of one full ingestion run across all registered sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRunResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub sources: Vec<SourceResult>,
    pub fetched: usize,
    pub upserted: usize,
    pub new_trends: usize,
    pub errors: usize,
}

impl IngestionRunResult {
    pub fn from_sources(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        sources: Vec<SourceResult>,
    ) -> Self {
        let fetched = sources.iter().map(|s| s.fetched).sum();
        let upserted = sources.iter().map(|s| s.upserted).sum();
        let new_trends = sources.iter().map(|s| s.new_trends).sum();
        let errors = sources.iter().map(|s| s.errors).sum();
        Self {
            run_id,
            started_at,
            finished_at,
            status: RunStatus::Completed,
            sources,
            fetched,
            upserted,
            new_trends,
            errors,
        }
    }

    /// Run that died before producing per-source results.
    pub fn failed(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Failed,
            sources: Vec::new(),
            fetched: 0,
            upserted: 0,
            new_trends: 0,
            errors: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_tags_round_trip() {
        for p in [
            SourcePlatform::Aliexpress,
            SourcePlatform::Tiktok,
            SourcePlatform::Temu,
            SourcePlatform::Shopify,
            SourcePlatform::Onchain,
        ] {
            assert_eq!(SourcePlatform::parse(p.as_str()), Some(p));
        }
        assert_eq!(SourcePlatform::parse("  TikTok "), Some(SourcePlatform::Tiktok));
        assert_eq!(SourcePlatform::parse("ebay"), None);
    }

    #[test]
    fn category_set_includes_other() {
        assert!(is_known_category("Other"));
        assert!(is_known_category("Electronics"));
        assert!(!is_known_category("Haunted Dolls"));
    }

    #[test]
    fn run_result_aggregates_source_counters() {
        let mut a = SourceResult::new(SourcePlatform::Aliexpress);
        a.fetched = 10;
        a.upserted = 8;
        a.new_trends = 3;
        a.errors = 2;
        let mut b = SourceResult::new(SourcePlatform::Temu);
        b.fetched = 5;
        b.upserted = 5;
        b.new_trends = 5;

        let now = Utc::now();
        let run = IngestionRunResult::from_sources(Uuid::new_v4(), now, now, vec![a, b]);
        assert_eq!(run.fetched, 15);
        assert_eq!(run.upserted, 13);
        assert_eq!(run.new_trends, 8);
        assert_eq!(run.errors, 2);
        assert_eq!(run.status, RunStatus::Completed);
    }
}
