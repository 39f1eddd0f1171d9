//! OCR stage handlers
//!
//! RECEIVED -> OCR_DONE: run OCR for a requested file, then hand the
//! extracted text to classification.

use super::StageHandler;
use crate::broker::BrokerClient;
use crate::error::{PipelineError, PipelineResult};
use crate::services::OcrEngine;
use crate::storage::Storage;
use async_trait::async_trait;
use scanflow_common::messages::{
    OcrCompleted, OcrFailed, OcrRequest, PredictDocumentType, OCR_COMPLETED, OCR_FAILED, OCR_REQUEST,
};
use scanflow_common::queues::{EVENTS, OCR_RESULTS, PREDICTION_REQUESTS};
use scanflow_common::{Envelope, NotificationKind, Notifier};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs OCR for `OCR_REQUEST` and reports the outcome
pub struct OcrRequestHandler {
    broker: Arc<BrokerClient>,
    ocr: Arc<dyn OcrEngine>,
}

impl OcrRequestHandler {
    pub fn new(broker: Arc<BrokerClient>, ocr: Arc<dyn OcrEngine>) -> Self {
        Self { broker, ocr }
    }
}

#[async_trait]
impl StageHandler for OcrRequestHandler {
    fn name(&self) -> &'static str {
        "ocr_request"
    }

    fn message_type(&self) -> &'static str {
        OCR_REQUEST
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        let request: OcrRequest = envelope.payload()?;

        match self.ocr.extract(Path::new(&request.file_path)).await {
            Ok(text) => {
                info!(file_path = %request.file_path, chars = text.len(), "OCR completed");
                let completed = Envelope::from_payload(&OcrCompleted {
                    file_path: request.file_path,
                    extracted_text: text,
                })?;
                self.broker
                    .publish(&self.broker.queue(OCR_RESULTS), &completed)
                    .await?;
                Ok(())
            }
            Err(e) => {
                let failed = Envelope::from_payload(&OcrFailed {
                    file_path: request.file_path.clone(),
                    error_message: e.to_string(),
                })?;
                self.broker.publish(&self.broker.queue(EVENTS), &failed).await?;
                Err(PipelineError::domain(request.file_path, e))
            }
        }
    }
}

/// Forwards OCR text to classification
pub struct OcrCompletedHandler {
    broker: Arc<BrokerClient>,
}

impl OcrCompletedHandler {
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl StageHandler for OcrCompletedHandler {
    fn name(&self) -> &'static str {
        "ocr_completed"
    }

    fn message_type(&self) -> &'static str {
        OCR_COMPLETED
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        let completed: OcrCompleted = envelope.payload()?;
        if completed.extracted_text.trim().is_empty() {
            return Err(PipelineError::domain(
                completed.file_path,
                "OCR produced no text",
            ));
        }

        let request = Envelope::from_payload(&PredictDocumentType {
            text: completed.extracted_text,
            file_path: completed.file_path.clone(),
        })?
        .with_reply_to(self.broker.queue(EVENTS));

        self.broker
            .publish(&self.broker.queue(PREDICTION_REQUESTS), &request)
            .await?;
        info!(file_path = %completed.file_path, "Prediction requested");
        Ok(())
    }
}

/// Records OCR failures and tells operators
pub struct OcrFailedHandler {
    storage: Option<Arc<dyn Storage>>,
    notifier: Arc<dyn Notifier>,
}

impl OcrFailedHandler {
    pub fn new(storage: Option<Arc<dyn Storage>>, notifier: Arc<dyn Notifier>) -> Self {
        Self { storage, notifier }
    }
}

#[async_trait]
impl StageHandler for OcrFailedHandler {
    fn name(&self) -> &'static str {
        "ocr_failed"
    }

    fn message_type(&self) -> &'static str {
        OCR_FAILED
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        let failed: OcrFailed = envelope.payload()?;
        warn!(file_path = %failed.file_path, error = %failed.error_message, "OCR failed");
        self.notifier.notify(
            NotificationKind::Warning,
            &format!("OCR failed for {}: {}", failed.file_path, failed.error_message),
        );

        if let Some(storage) = &self.storage {
            let payload = serde_json::Value::Object(envelope.data().clone());
            storage
                .record_event(OCR_FAILED, &payload)
                .await
                .map_err(|e| PipelineError::domain(&failed.file_path, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::OcrError;
    use crate::test_support::{memory_broker, published, RecordingStorage};
    use scanflow_common::messages::PREDICT_DOCUMENT_TYPE;
    use scanflow_common::{EventBus, PipelineEvent};

    struct FakeOcr(Result<&'static str, &'static str>);

    #[async_trait]
    impl OcrEngine for FakeOcr {
        async fn extract(&self, file_path: &Path) -> Result<String, OcrError> {
            match self.0 {
                Ok(text) => Ok(text.to_string()),
                Err(_) => Err(OcrError::FileNotFound(file_path.display().to_string())),
            }
        }
    }

    fn ocr_request(path: &str) -> Envelope {
        Envelope::from_payload(&OcrRequest {
            file_path: path.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_request_publishes_completion() {
        let (broker, transport) = memory_broker().await;
        let handler = OcrRequestHandler::new(broker.clone(), Arc::new(FakeOcr(Ok("Invoice 42"))));

        handler.handle(&ocr_request("/scans/a.png")).await.unwrap();

        let out = published(&transport, "ocr_results");
        assert_eq!(out.len(), 1);
        let completed: OcrCompleted = out[0].payload().unwrap();
        assert_eq!(completed.extracted_text, "Invoice 42");
    }

    #[tokio::test]
    async fn test_request_failure_publishes_ocr_failed() {
        let (broker, transport) = memory_broker().await;
        let handler = OcrRequestHandler::new(broker.clone(), Arc::new(FakeOcr(Err("boom"))));

        let err = handler.handle(&ocr_request("/scans/b.png")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Domain { .. }));

        let events = published(&transport, "events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message_type(), OCR_FAILED);
        assert!(published(&transport, "ocr_results").is_empty());
    }

    #[tokio::test]
    async fn test_completed_forwards_with_reply_to() {
        let (broker, transport) = memory_broker().await;
        let handler = OcrCompletedHandler::new(broker.clone());
        let envelope = Envelope::from_payload(&OcrCompleted {
            file_path: "/scans/c.png".to_string(),
            extracted_text: "Annual report".to_string(),
        })
        .unwrap();

        handler.handle(&envelope).await.unwrap();

        let requests = published(&transport, "prediction_requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message_type(), PREDICT_DOCUMENT_TYPE);
        assert_eq!(requests[0].reply_to(), Some("events"));
        assert_eq!(requests[0].str_field("text"), Some("Annual report"));
    }

    #[tokio::test]
    async fn test_completed_rejects_blank_text() {
        let (broker, transport) = memory_broker().await;
        let handler = OcrCompletedHandler::new(broker.clone());
        let envelope = Envelope::from_payload(&OcrCompleted {
            file_path: "/scans/d.png".to_string(),
            extracted_text: "  \n ".to_string(),
        })
        .unwrap();

        let err = handler.handle(&envelope).await.unwrap_err();
        assert!(matches!(err, PipelineError::Domain { ref file_path, .. } if file_path == "/scans/d.png"));
        assert!(published(&transport, "prediction_requests").is_empty());
    }

    #[tokio::test]
    async fn test_failed_records_and_notifies() {
        let storage = Arc::new(RecordingStorage::default());
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let handler = OcrFailedHandler::new(Some(storage.clone()), Arc::new(bus));

        let envelope = Envelope::from_payload(&OcrFailed {
            file_path: "e.png".to_string(),
            error_message: "unreadable".to_string(),
        })
        .unwrap();
        handler.handle(&envelope).await.unwrap();

        assert_eq!(storage.event_types(), vec![OCR_FAILED.to_string()]);
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::Notification { kind: NotificationKind::Warning, .. }
        ));
    }
}
