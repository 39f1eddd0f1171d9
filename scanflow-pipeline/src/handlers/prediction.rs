//! Classification handlers
//!
//! OCR_DONE -> CLASSIFIED -> DONE. Every prediction is followed by a
//! feedback request so a person can confirm or correct it.

use super::StageHandler;
use crate::broker::BrokerClient;
use crate::error::{PipelineError, PipelineResult};
use crate::prediction::PredictionEngine;
use crate::storage::Storage;
use crate::types::{DocumentRef, PredictionResult};
use async_trait::async_trait;
use scanflow_common::messages::{
    PredictDocumentType, PredictDocumentTypeResult, UiFeedbackRequest, PREDICT_DOCUMENT_TYPE,
    PREDICT_DOCUMENT_TYPE_RESULT,
};
use scanflow_common::queues::{PREDICTION_RESULTS, UI_FEEDBACK_REQUESTS};
use scanflow_common::Envelope;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PredictionHandler {
    broker: Arc<BrokerClient>,
    engine: Arc<PredictionEngine>,
    storage: Option<Arc<dyn Storage>>,
}

impl PredictionHandler {
    pub fn new(
        broker: Arc<BrokerClient>,
        engine: Arc<PredictionEngine>,
        storage: Option<Arc<dyn Storage>>,
    ) -> Self {
        Self {
            broker,
            engine,
            storage,
        }
    }

    async fn valid_types(&self) -> Option<Vec<String>> {
        let storage = self.storage.as_ref()?;
        match storage.get_valid_doc_types().await {
            Ok(types) => Some(types),
            Err(e) => {
                warn!(error = %e, "Could not load valid document types");
                None
            }
        }
    }
}

#[async_trait]
impl StageHandler for PredictionHandler {
    fn name(&self) -> &'static str {
        "prediction"
    }

    fn message_type(&self) -> &'static str {
        PREDICT_DOCUMENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        let request: PredictDocumentType = envelope.payload()?;
        let prediction = self.engine.predict(&request.text).await;
        info!(
            file_path = %request.file_path,
            document_type = %prediction.document_type,
            is_rule_based = prediction.is_rule_based,
            confidence = ?prediction.confidence,
            "Document classified"
        );

        let result = Envelope::from_payload(&PredictDocumentTypeResult {
            file_path: request.file_path.clone(),
            document_type: prediction.document_type.clone(),
            is_rule_based: prediction.is_rule_based,
            confidence: prediction.confidence,
        })?;

        let results_queue = self.broker.queue(PREDICTION_RESULTS);
        self.broker.publish(&results_queue, &result).await?;
        if let Some(reply_to) = envelope.reply_to() {
            if reply_to != results_queue {
                self.broker.publish(reply_to, &result).await?;
            }
        }

        let feedback = Envelope::from_payload(&UiFeedbackRequest {
            file_path: request.file_path,
            predicted_type: prediction.document_type,
            valid_types: self.valid_types().await,
        })?;
        self.broker
            .publish(&self.broker.queue(UI_FEEDBACK_REQUESTS), &feedback)
            .await?;
        Ok(())
    }
}

/// Persists classifications returned on a consumed queue
pub struct PredictionResultHandler {
    storage: Arc<dyn Storage>,
}

impl PredictionResultHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StageHandler for PredictionResultHandler {
    fn name(&self) -> &'static str {
        "prediction_result"
    }

    fn message_type(&self) -> &'static str {
        PREDICT_DOCUMENT_TYPE_RESULT
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        let result: PredictDocumentTypeResult = envelope.payload()?;
        let document =
            DocumentRef::new(&result.file_path).with_document_type(&result.document_type);
        let prediction = PredictionResult {
            document_type: result.document_type.clone(),
            is_rule_based: result.is_rule_based,
            confidence: result.confidence,
        };

        self.storage
            .save_document_type(&document, &prediction)
            .await
            .map_err(|e| PipelineError::domain(&result.file_path, e))?;
        self.storage
            .record_event(
                "PREDICTION_COMPLETED",
                &serde_json::Value::Object(envelope.data().clone()),
            )
            .await
            .map_err(|e| PipelineError::domain(&result.file_path, e))?;

        debug!(file_path = %result.file_path, document_type = %result.document_type, "Classification stored");
        Ok(())
    }
}
