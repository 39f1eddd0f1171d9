//! HTTP surface tests

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use helpers::{start_pipeline, test_config};
use http_body_util::BodyExt;
use scanflow_common::{EventBus, QueueNames};
use scanflow_pipeline::broker::{BrokerClient, InMemoryTransport, ReconnectPolicy};
use scanflow_pipeline::{build_router, AppState};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
    let response = build_router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health_reports_running_consumers() {
    let test = start_pipeline(test_config()).await;
    let state = AppState::from_pipeline(&test.pipeline);

    let (status, body) = get_json(state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "scanflow-pipeline");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["broker_connected"], true);
    assert_eq!(body["ml_enabled"], false);
    assert!(body.get("last_error").is_none());

    let queues: Vec<&str> = body["consumers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["queue"].as_str().unwrap())
        .collect();
    assert_eq!(
        queues,
        vec!["events", "ocr_requests", "ocr_results", "prediction_requests"]
    );

    test.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_health_degraded_without_broker() {
    let broker = Arc::new(BrokerClient::new(
        Arc::new(InMemoryTransport::new()),
        QueueNames::new(""),
        ReconnectPolicy::default(),
        EventBus::new(8),
    ));
    let state = AppState::new(broker, None);
    *state.last_error.write().await = Some("broker unreachable".to_string());

    let (status, body) = get_json(state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["broker_connected"], false);
    assert_eq!(body["consumers"], Value::Array(Vec::new()));
    assert_eq!(body["last_error"], "broker unreachable");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let broker = Arc::new(BrokerClient::new(
        Arc::new(InMemoryTransport::new()),
        QueueNames::new(""),
        ReconnectPolicy::default(),
        EventBus::new(8),
    ));

    let (status, _) = get_json(AppState::new(broker, None), "/classify").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
