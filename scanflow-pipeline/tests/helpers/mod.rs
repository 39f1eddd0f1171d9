//! Shared fixtures for scanflow-pipeline integration tests

#![allow(dead_code)]

use scanflow_common::config::PipelineConfig;
use scanflow_common::{decode, Envelope, EventBus};
use scanflow_pipeline::broker::InMemoryTransport;
use scanflow_pipeline::registry::BuildContext;
use scanflow_pipeline::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Config with rules-only prediction and fast reconnects
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.prediction.use_ml_model = false;
    config.broker.reconnect.base_delay_ms = 5;
    config.broker.reconnect.max_delay_ms = 20;
    config.http.enabled = false;
    config
}

pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub transport: InMemoryTransport,
    pub root: TempDir,
}

/// Build and start a pipeline over an in-memory broker in a temp root folder
pub async fn start_pipeline(config: PipelineConfig) -> TestPipeline {
    let root = tempfile::tempdir().unwrap();
    let transport = InMemoryTransport::new();
    let ctx = BuildContext::new(Arc::new(config), root.path().to_path_buf(), EventBus::new(256))
        .with_transport(Arc::new(transport.clone()));

    let pipeline = Pipeline::build(ctx).await.unwrap();
    pipeline.start().await.unwrap();
    TestPipeline {
        pipeline,
        transport,
        root,
    }
}

/// Envelopes published to `queue`
pub fn published(transport: &InMemoryTransport, queue: &str) -> Vec<Envelope> {
    transport
        .published(queue)
        .iter()
        .map(|body| decode(body).unwrap())
        .collect()
}

/// Wait until `condition` holds, failing the test after five seconds
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until nothing is queued or in flight on `queues`
pub async fn wait_idle(transport: &InMemoryTransport, queues: &[&str]) {
    wait_until("consumers to go idle", || {
        transport.unacked_count() == 0 && queues.iter().all(|q| transport.queue_depth(q) == 0)
    })
    .await;
}
