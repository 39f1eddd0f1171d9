//! Retraining bracket
//!
//! Corrections accumulate until a batch is full. The trigger then asks the
//! training collaborator to retrain and pauses prediction-request
//! consumption; the completion (or failure) reply resumes it. A watchdog
//! resumes analysis if no reply arrives in time.

use super::StageHandler;
use crate::broker::BrokerClient;
use crate::error::{PipelineError, PipelineResult};
use crate::gate::AnalysisGate;
use crate::prediction::PredictionEngine;
use crate::storage::Storage;
use async_trait::async_trait;
use chrono::Utc;
use scanflow_common::messages::{
    StartTraining, TrainingCompleted, TrainingFailed, TRAINING_COMPLETED, TRAINING_FAILED,
};
use scanflow_common::queues::AI_TRAINING_QUEUE;
use scanflow_common::{Envelope, NotificationKind, Notifier};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Counts training samples and starts retraining when a batch is full
pub struct TrainingTrigger {
    broker: Arc<BrokerClient>,
    gate: AnalysisGate,
    batch_size: usize,
    pause_timeout: Duration,
    pending: Mutex<usize>,
}

impl TrainingTrigger {
    /// `batch_size` 0 never triggers
    pub fn new(
        broker: Arc<BrokerClient>,
        gate: AnalysisGate,
        batch_size: usize,
        pause_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            gate,
            batch_size,
            pause_timeout,
            pending: Mutex::new(0),
        }
    }

    pub fn gate(&self) -> &AnalysisGate {
        &self.gate
    }

    pub async fn pending_samples(&self) -> usize {
        *self.pending.lock().await
    }

    /// Count one sample; returns true when this sample started retraining
    pub async fn record_sample(&self) -> PipelineResult<bool> {
        if self.batch_size == 0 {
            return Ok(false);
        }

        let mut pending = self.pending.lock().await;
        *pending += 1;
        if *pending < self.batch_size {
            return Ok(false);
        }

        let request = Envelope::from_payload(&StartTraining {
            sample_count: *pending,
            requested_at: Utc::now(),
        })?;
        if let Err(e) = self
            .broker
            .publish(&self.broker.queue(AI_TRAINING_QUEUE), &request)
            .await
        {
            // The feedback delivery is requeued and counts this sample again
            *pending -= 1;
            return Err(e.into());
        }

        info!(samples = *pending, "Retraining requested, pausing analysis");
        *pending = 0;
        let generation = self.gate.pause();
        self.arm_watchdog(generation);
        Ok(true)
    }

    fn arm_watchdog(&self, generation: u64) {
        let gate = self.gate.clone();
        let timeout = self.pause_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if gate.resume_if_current(generation) {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "No training reply received, resuming analysis"
                );
            }
        });
    }
}

pub struct TrainingCompletedHandler {
    engine: Arc<PredictionEngine>,
    storage: Option<Arc<dyn Storage>>,
    gate: AnalysisGate,
    notifier: Arc<dyn Notifier>,
}

impl TrainingCompletedHandler {
    pub fn new(
        engine: Arc<PredictionEngine>,
        storage: Option<Arc<dyn Storage>>,
        gate: AnalysisGate,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            engine,
            storage,
            gate,
            notifier,
        }
    }

    async fn apply(&self, completed: &TrainingCompleted) -> PipelineResult<()> {
        if let (Some(metrics), Some(storage)) = (&completed.training_metrics, &self.storage) {
            if let Err(e) = storage.record_event(TRAINING_COMPLETED, metrics).await {
                warn!(error = %e, "Could not record training metrics");
            }
        }

        let Some(model_path) = &completed.model_path else {
            info!("Training completed without a new model");
            return Ok(());
        };

        match self.engine.apply_trained_model(Path::new(model_path)).await {
            Ok(labels) => {
                self.notifier.notify(
                    NotificationKind::Info,
                    &format!("Prediction model updated ({} document types)", labels),
                );
                Ok(())
            }
            Err(e) => {
                error!(model_path = %model_path, error = %e, "Trained model rejected, keeping previous model");
                self.notifier.notify(
                    NotificationKind::Error,
                    &format!("Trained model {} rejected: {}", model_path, e),
                );
                Err(PipelineError::domain(model_path, e))
            }
        }
    }
}

#[async_trait]
impl StageHandler for TrainingCompletedHandler {
    fn name(&self) -> &'static str {
        "training_completed"
    }

    fn message_type(&self) -> &'static str {
        TRAINING_COMPLETED
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        let result = match envelope.payload::<TrainingCompleted>() {
            Ok(completed) => self.apply(&completed).await,
            Err(e) => Err(e.into()),
        };
        self.gate.resume();
        info!("Analysis resumed after training");
        result
    }
}

pub struct TrainingFailedHandler {
    storage: Option<Arc<dyn Storage>>,
    gate: AnalysisGate,
    notifier: Arc<dyn Notifier>,
}

impl TrainingFailedHandler {
    pub fn new(
        storage: Option<Arc<dyn Storage>>,
        gate: AnalysisGate,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            storage,
            gate,
            notifier,
        }
    }
}

#[async_trait]
impl StageHandler for TrainingFailedHandler {
    fn name(&self) -> &'static str {
        "training_failed"
    }

    fn message_type(&self) -> &'static str {
        TRAINING_FAILED
    }

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()> {
        self.gate.resume();
        let failed: TrainingFailed = envelope.payload()?;

        error!(error = %failed.error_message, "Training failed, analysis resumed with current model");
        self.notifier.notify(
            NotificationKind::Error,
            &format!("Training failed: {}", failed.error_message),
        );

        if let Some(storage) = &self.storage {
            let payload = serde_json::Value::Object(envelope.data().clone());
            if let Err(e) = storage.record_event(TRAINING_FAILED, &payload).await {
                warn!(error = %e, "Could not record training failure");
            }
        }
        Ok(())
    }
}
