//! Fakes shared by unit tests

use crate::broker::{BrokerClient, InMemoryTransport, ReconnectPolicy};
use crate::storage::{Storage, StorageError};
use crate::types::{DocumentRef, FeedbackRecord, PredictionResult};
use async_trait::async_trait;
use scanflow_common::{decode, Envelope, EventBus, QueueNames};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Connected broker client over a fresh in-memory transport, no prefix
pub async fn memory_broker() -> (Arc<BrokerClient>, InMemoryTransport) {
    let transport = InMemoryTransport::new();
    let broker = Arc::new(BrokerClient::new(
        Arc::new(transport.clone()),
        QueueNames::new(""),
        ReconnectPolicy::default(),
        EventBus::new(64),
    ));
    broker.connect().await.unwrap();
    (broker, transport)
}

/// Envelopes published to `queue`
pub fn published(transport: &InMemoryTransport, queue: &str) -> Vec<Envelope> {
    transport
        .published(queue)
        .iter()
        .map(|body| decode(body).unwrap())
        .collect()
}

#[derive(Default)]
struct Recorded {
    feedback: Vec<(String, String)>,
    classifications: Vec<(String, String)>,
    events: Vec<(String, Value)>,
}

/// Storage that keeps everything in vectors, or fails every call
#[derive(Default)]
pub struct RecordingStorage {
    types: Vec<String>,
    fail: bool,
    recorded: Mutex<Recorded>,
}

impl RecordingStorage {
    pub fn with_types(types: &[&str]) -> Self {
        Self {
            types: types.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn feedback(&self) -> Vec<(String, String)> {
        self.recorded.lock().unwrap().feedback.clone()
    }

    pub fn classifications(&self) -> Vec<(String, String)> {
        self.recorded.lock().unwrap().classifications.clone()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.recorded
            .lock()
            .unwrap()
            .events
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.fail {
            Err(StorageError::Io(std::io::Error::other("storage offline")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn save_feedback(&self, record: &FeedbackRecord) -> Result<(), StorageError> {
        self.check()?;
        self.recorded
            .lock()
            .unwrap()
            .feedback
            .push((record.file_path.clone(), record.doc_type.clone()));
        Ok(())
    }

    async fn get_valid_doc_types(&self) -> Result<Vec<String>, StorageError> {
        self.check()?;
        Ok(self.types.clone())
    }

    async fn add_document_types(&self, _types: &[String]) -> Result<(), StorageError> {
        self.check()
    }

    async fn save_document_type(
        &self,
        document: &DocumentRef,
        result: &PredictionResult,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.recorded
            .lock()
            .unwrap()
            .classifications
            .push((document.file_path.clone(), result.document_type.clone()));
        Ok(())
    }

    async fn record_event(&self, event_type: &str, payload: &Value) -> Result<(), StorageError> {
        self.check()?;
        self.recorded
            .lock()
            .unwrap()
            .events
            .push((event_type.to_string(), payload.clone()));
        Ok(())
    }
}
