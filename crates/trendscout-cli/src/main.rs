use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trendscout_adapters::adapter_for_source;
use trendscout_engine::{
    load_source_registry, EngineConfig, IngestScheduler, IngestionPipeline, TrendEvents,
    TriggerOutcome,
};
use trendscout_storage::{
    FetcherConfig, HttpFetcher, InMemoryTrendStore, PgTrendStore, TrendStore,
};
use trendscout_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "trendscout")]
#[command(about = "Marketplace trend ingestion and scoring")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full ingestion pass across all enabled sources and exit.
    Ingest,
    /// Start the web surface, with the cron scheduler if enabled.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("trendscout=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

/// Wires store, fetcher, and every enabled registry source into a guarded
/// scheduler. Without DATABASE_URL the run is held in memory only.
async fn build_scheduler(config: &EngineConfig) -> Result<Arc<IngestScheduler>> {
    let store: Arc<dyn TrendStore> = match &config.database_url {
        Some(url) => {
            let store = PgTrendStore::connect(url).await?;
            store.ensure_schema().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(InMemoryTrendStore::new())
        }
    };

    let fetcher = Arc::new(HttpFetcher::new(FetcherConfig {
        timeout: Duration::from_secs(config.fetch_timeout_secs),
        user_agent: config.user_agent.clone(),
        ..FetcherConfig::default()
    })?);

    let registry = load_source_registry(&config.registry_path)?;
    let pipeline = Arc::new(IngestionPipeline::new(
        store,
        TrendEvents::default(),
        config.pipeline_config(),
    ));
    for entry in registry.sources.iter().filter(|e| e.enabled) {
        let Some(endpoint) = entry.endpoint.clone() else {
            tracing::warn!(platform = %entry.platform, "enabled source has no endpoint, skipping");
            continue;
        };
        let adapter = adapter_for_source(entry.platform, Arc::clone(&fetcher), endpoint);
        pipeline.register_source(
            adapter,
            entry.base_score.unwrap_or(config.default_base_score),
        );
    }

    Ok(Arc::new(IngestScheduler::new(pipeline)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = EngineConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let scheduler = build_scheduler(&config).await?;
            match scheduler.trigger().await {
                TriggerOutcome::Completed(result) => {
                    for source in &result.sources {
                        println!(
                            "  {}: fetched={} upserted={} new={} errors={}",
                            source.source,
                            source.fetched,
                            source.upserted,
                            source.new_trends,
                            source.errors
                        );
                    }
                    println!(
                        "ingestion {:?}: run_id={} fetched={} upserted={} new={} errors={}",
                        result.status,
                        result.run_id,
                        result.fetched,
                        result.upserted,
                        result.new_trends,
                        result.errors
                    );
                }
                TriggerOutcome::Skipped => {
                    println!("ingestion skipped: a run is already in progress");
                }
            }
        }
        Commands::Serve { port } => {
            let scheduler = build_scheduler(&config).await?;
            // held for the lifetime of the process; dropping it stops the crons
            let _cron = if config.scheduler_enabled {
                Some(Arc::clone(&scheduler).start_cron(&config).await?)
            } else {
                None
            };
            trendscout_web::serve(port, AppState::new(scheduler)).await?;
        }
    }

    Ok(())
}
