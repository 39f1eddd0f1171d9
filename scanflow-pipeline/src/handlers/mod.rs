//! Stage handlers
//!
//! Each handler is bound to one message type, does one unit of work, and
//! publishes zero or more follow-up envelopes. Handlers return structured
//! errors and never settle deliveries themselves.

pub mod feedback;
pub mod ocr;
pub mod prediction;
pub mod training;

use crate::error::PipelineResult;
use async_trait::async_trait;
use scanflow_common::Envelope;

pub use feedback::FeedbackHandler;
pub use ocr::{OcrCompletedHandler, OcrFailedHandler, OcrRequestHandler};
pub use prediction::{PredictionHandler, PredictionResultHandler};
pub use training::{TrainingCompletedHandler, TrainingFailedHandler, TrainingTrigger};

#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// The message type this handler consumes
    fn message_type(&self) -> &'static str;

    async fn handle(&self, envelope: &Envelope) -> PipelineResult<()>;
}
