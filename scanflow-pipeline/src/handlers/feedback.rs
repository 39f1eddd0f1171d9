//! User corrections
//!
//! FEEDBACK_PENDING -> CLASSIFIED. A correction is stored, audited, and
//! forwarded to the training collaborator as a sample.

use super::training::TrainingTrigger;
use super::StageHandler;
use crate::broker::BrokerClient;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::Storage;
use crate::types::FeedbackRecord;
use async_trait::async_trait;
use chrono::Utc;
use scanflow_common::messages::{SaveFeedback, TrainingSample, SAVE_FEEDBACK};
use scanflow_common::queues::AI_TRAINING_QUEUE;
use scanflow_common::Envelope;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub struct FeedbackHandler {
    broker: Arc<BrokerClient>,
    storage: Arc<dyn Storage>,
    trigger: Option<Arc<TrainingTrigger>>,
}

impl FeedbackHandler {
    pub fn new(
        broker: Arc<BrokerClient>,
        storage: Arc<dyn Storage>,
        trigger: Option<Arc<TrainingTrigger>>,
    ) -> Self {
        Self {
            broker,
            storage,
            trigger,
        }
    }
}

#[async_trait]
impl StageHandler for FeedbackHandler {
    fn name(&self) -> &'static str {
        "feedback"
    }

    fn message_type(&self) -> &'static str {
        SAVE_FEEDBACK
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        let feedback: SaveFeedback = envelope.payload()?;
        let record = FeedbackRecord {
            file_path: feedback.file_path,
            doc_type: feedback.doc_type,
            timestamp: Utc::now(),
        };

        self.storage
            .save_feedback(&record)
            .await
            .map_err(|e| PipelineError::domain(&record.file_path, e))?;
        self.storage
            .record_event(
                "USER_FEEDBACK_RECEIVED",
                &json!({
                    "file_path": record.file_path,
                    "doc_type": record.doc_type,
                    "timestamp": record.timestamp,
                }),
            )
            .await
            .map_err(|e| PipelineError::domain(&record.file_path, e))?;
        info!(file_path = %record.file_path, doc_type = %record.doc_type, "Feedback saved");

        let sample = Envelope::from_payload(&TrainingSample {
            file_path: record.file_path,
            doc_type: record.doc_type,
            timestamp: record.timestamp,
        })?;
        self.broker
            .publish(&self.broker.queue(AI_TRAINING_QUEUE), &sample)
            .await?;

        if let Some(trigger) = &self.trigger {
            trigger.record_sample().await?;
        }
        Ok(())
    }
}
