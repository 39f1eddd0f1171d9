//! scanflow-pipeline library interface
//!
//! Document pipeline over a message broker: OCR text is classified by
//! keyword rules or embedding similarity, predictions go out for human
//! feedback, and corrections feed periodic retraining.

pub mod api;
pub mod broker;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod prediction;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod services;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;

pub use crate::error::{PipelineError, PipelineResult};
pub use crate::runtime::Pipeline;

use axum::Router;
use broker::BrokerClient;
use chrono::{DateTime, Utc};
use prediction::PredictionEngine;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<BrokerClient>,
    /// Absent when the manager graph has no prediction engine
    pub engine: Option<Arc<PredictionEngine>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(broker: Arc<BrokerClient>, engine: Option<Arc<PredictionEngine>>) -> Self {
        Self {
            broker,
            engine,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn from_pipeline(pipeline: &Pipeline) -> Self {
        Self::new(pipeline.broker().clone(), pipeline.prediction_engine())
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .with_state(state)
}
