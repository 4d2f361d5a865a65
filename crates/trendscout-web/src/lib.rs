//! Axum JSON surface over the ingestion scheduler: health, status, and a
//! manual trigger that shares the single-run guard with cron firings.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use trendscout_engine::{IngestScheduler, TriggerOutcome};

pub const CRATE_NAME: &str = "trendscout-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<IngestScheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<IngestScheduler>) -> Self {
        Self { scheduler }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .route("/ingest/run", post(ingest_run_handler))
        .with_state(state)
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "web surface listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn status_handler(State(state): State<AppState>) -> Response {
    Json(state.scheduler.status()).into_response()
}

/// Runs a full ingestion inline and reports its counters. A 409 means a run
/// was already in flight; nothing is queued behind it.
async fn ingest_run_handler(State(state): State<AppState>) -> Response {
    match state.scheduler.trigger().await {
        TriggerOutcome::Completed(result) => Json(result).into_response(),
        TriggerOutcome::Skipped => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "skipped" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use trendscout_adapters::StaticAdapter;
    use trendscout_core::{RawListing, SourcePlatform};
    use trendscout_engine::{IngestionPipeline, PipelineConfig, TrendEvents};
    use trendscout_storage::InMemoryTrendStore;

    fn listing(id: &str, price: f64) -> RawListing {
        RawListing {
            external_id: Some(id.to_string()),
            title: Some(format!("Product {id}")),
            source: Some("tiktok".to_string()),
            price: Some(json!(price)),
            currency: Some("USD".to_string()),
            category: Some("Gadgets".to_string()),
            ..RawListing::default()
        }
    }

    fn test_state() -> AppState {
        let store = Arc::new(InMemoryTrendStore::new());
        let pipeline = Arc::new(IngestionPipeline::new(
            store,
            TrendEvents::default(),
            PipelineConfig::default(),
        ));
        pipeline.register_source(
            Arc::new(StaticAdapter::new(
                SourcePlatform::Tiktok,
                vec![listing("a-1", 12.99), listing("a-2", 7.45)],
            )),
            50.0,
        );
        AppState::new(Arc::new(IngestScheduler::new(pipeline)))
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn status_starts_idle_with_no_runs() {
        let app = app(test_state());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["isRunning"], false);
        assert_eq!(value["lastRunAt"], serde_json::Value::Null);
        assert_eq!(value["cronActive"], false);
    }

    #[tokio::test]
    async fn manual_trigger_runs_and_updates_status() {
        let app = app(test_state());
        let resp = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/ingest/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["fetched"], 2);
        assert_eq!(value["new_trends"], 2);

        let status = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = status.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["isRunning"], false);
        assert_ne!(value["lastRunAt"], serde_json::Value::Null);
    }
}
