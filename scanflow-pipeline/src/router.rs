//! Event router
//!
//! Maps a message `type` to its stage handler by exact match. Anything
//! that cannot be handled (unknown type, missing required fields, ill-typed
//! payload) becomes exactly one `REQUEST_FEEDBACK` on the feedback queue and
//! the original is considered handled.

use crate::broker::BrokerClient;
use crate::error::{PipelineError, PipelineResult};
use crate::handlers::StageHandler;
use chrono::Utc;
use scanflow_common::messages::{required_fields, RequestFeedback};
use scanflow_common::queues::FEEDBACK_QUEUE;
use scanflow_common::Envelope;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct EventRouter {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
    broker: Arc<BrokerClient>,
}

impl EventRouter {
    pub fn new(broker: Arc<BrokerClient>) -> Self {
        Self {
            handlers: HashMap::new(),
            broker,
        }
    }

    /// Bind `handler` to `message_type`, replacing any earlier binding
    pub fn register(&mut self, message_type: impl Into<String>, handler: Arc<dyn StageHandler>) {
        let message_type = message_type.into();
        let name = handler.name();
        if let Some(previous) = self.handlers.insert(message_type.clone(), handler) {
            warn!(
                message_type = %message_type,
                previous = previous.name(),
                replacement = name,
                "Handler replaced"
            );
        } else {
            debug!(message_type = %message_type, handler = name, "Handler registered");
        }
    }

    /// Register under the handler's own message type
    pub fn register_handler(&mut self, handler: Arc<dyn StageHandler>) {
        let message_type = handler.message_type();
        self.register(message_type, handler);
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Registered message types, sorted
    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub async fn dispatch(&self, envelope: &Envelope) -> PipelineResult<()> {
        let message_type = envelope.message_type();
        let Some(handler) = self.handlers.get(message_type) else {
            warn!(message_type, "No handler for message type");
            return self
                .request_feedback(envelope, format!("Unknown message type: {}", message_type))
                .await;
        };

        let missing = envelope.missing_fields(required_fields(message_type));
        if !missing.is_empty() {
            warn!(message_type, missing = ?missing, "Message is missing required fields");
            return self
                .request_feedback(
                    envelope,
                    format!("Missing required fields: {}", missing.join(", ")),
                )
                .await;
        }

        debug!(message_type, handler = handler.name(), "Dispatching");
        match handler.handle(envelope).await {
            Err(PipelineError::Validation { reason, .. }) => {
                warn!(message_type, reason = %reason, "Message failed validation");
                self.request_feedback(envelope, format!("Invalid message: {}", reason))
                    .await
            }
            other => other,
        }
    }

    async fn request_feedback(&self, envelope: &Envelope, reason: String) -> PipelineResult<()> {
        self.publish_feedback_request(envelope.to_json_value(), reason)
            .await
    }

    /// Feedback request for a body that could not be decoded
    pub async fn request_feedback_raw(&self, body: &[u8], reason: String) -> PipelineResult<()> {
        let original = Value::String(String::from_utf8_lossy(body).into_owned());
        self.publish_feedback_request(original, reason).await
    }

    async fn publish_feedback_request(
        &self,
        original_message: Value,
        error_reason: String,
    ) -> PipelineResult<()> {
        let request = Envelope::from_payload(&RequestFeedback {
            original_message,
            error_reason,
            timestamp: Utc::now(),
        })?;
        self.broker
            .publish(&self.broker.queue(FEEDBACK_QUEUE), &request)
            .await?;
        Ok(())
    }
}
