//! Liveness reporting for the mirror, plus the Prometheus scrape endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::Metrics;
use crate::mirror::Mirror;

/// A caught-up mirror completed a run within this window.
const COMPLETION_FRESHNESS: Duration = Duration::from_secs(30);
/// ...and has a record no older than this.
const RECORD_FRESHNESS: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct AppState {
    pub mirror: Arc<Mirror>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    last_completion: Option<DateTime<Utc>>,
    last_record_timestamp: Option<DateTime<Utc>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let last_completion = state.mirror.last_completion();
    let last_record_timestamp = state.mirror.last_record_timestamp().await.ok().flatten();

    let now = Utc::now();
    let caught_up = fresh(now, last_completion, COMPLETION_FRESHNESS)
        && fresh(now, last_record_timestamp, RECORD_FRESHNESS);

    let status = if caught_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if caught_up { "ok" } else { "catching_up" },
        last_completion,
        last_record_timestamp,
    };
    (status, Json(body))
}

fn fresh(now: DateTime<Utc>, at: Option<DateTime<Utc>>, window: Duration) -> bool {
    match at {
        Some(at) => now.signed_duration_since(at).to_std().unwrap_or_default() < window,
        None => false,
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        state.metrics.encode(),
    )
}
