//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use scanflow_common::ConsumerState;
use serde::Serialize;

use crate::AppState;

/// State of one queue consumer
#[derive(Debug, Serialize)]
pub struct ConsumerStatus {
    pub queue: String,
    pub state: ConsumerState,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "ok" when the broker is connected, "degraded" otherwise
    pub status: String,
    /// Module name ("scanflow-pipeline")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    pub broker_connected: bool,
    /// Whether predictions may use the embedding model
    pub ml_enabled: bool,
    pub consumers: Vec<ConsumerStatus>,
    /// Last error message if any (for diagnostics)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let broker_connected = state.broker.is_connected();
    let consumers = state
        .broker
        .consumer_states()
        .await
        .into_iter()
        .map(|(queue, state)| ConsumerStatus { queue, state })
        .collect();
    let last_error = state.last_error.read().await.clone();

    Json(HealthResponse {
        status: if broker_connected { "ok" } else { "degraded" }.to_string(),
        module: "scanflow-pipeline".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        broker_connected,
        ml_enabled: state
            .engine
            .as_ref()
            .is_some_and(|engine| engine.use_ml_model()),
        consumers,
        last_error,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
