//! Delivery handling
//!
//! Glue between the broker client and the router: decode the body, route
//! the envelope, report the outcome on the event bus, and pick the broker
//! disposition from the error class.

use crate::broker::{DeliveryHandler, Disposition};
use crate::error::PipelineError;
use crate::router::EventRouter;
use async_trait::async_trait;
use chrono::Utc;
use scanflow_common::{decode, EventBus, PipelineEvent};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub struct MessageDispatcher {
    router: Arc<EventRouter>,
    events: EventBus,
    dead_letter_malformed: bool,
}

impl MessageDispatcher {
    pub fn new(router: Arc<EventRouter>, events: EventBus, dead_letter_malformed: bool) -> Self {
        Self {
            router,
            events,
            dead_letter_malformed,
        }
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    async fn malformed(&self, queue: &str, payload: &[u8], reason: String) -> Disposition {
        warn!(
            queue,
            reason = %reason,
            body = %String::from_utf8_lossy(payload),
            "Malformed message rejected"
        );

        if self.dead_letter_malformed {
            if let Err(e) = self
                .router
                .request_feedback_raw(payload, format!("Malformed message: {}", reason))
                .await
            {
                warn!(queue, error = %e, "Could not dead-letter malformed message");
            }
        }

        self.events.emit_lossy(PipelineEvent::StageFailed {
            queue: queue.to_string(),
            message_type: String::new(),
            file_path: None,
            reason,
            timestamp: Utc::now(),
        });
        Disposition::Reject
    }
}

#[async_trait]
impl DeliveryHandler for MessageDispatcher {
    async fn handle_delivery(&self, queue: &str, payload: &[u8]) -> Disposition {
        let envelope = match decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => return self.malformed(queue, payload, e.to_string()).await,
        };

        let message_type = envelope.message_type().to_string();
        let file_path = envelope.str_field("file_path").map(str::to_string);

        match self.router.dispatch(&envelope).await {
            Ok(()) => {
                debug!(queue, message_type = %message_type, file_path = ?file_path, "Message handled");
                self.events.emit_lossy(PipelineEvent::StageCompleted {
                    queue: queue.to_string(),
                    message_type,
                    file_path,
                    timestamp: Utc::now(),
                });
                Disposition::Ack
            }
            Err(err) => {
                let disposition = err.disposition();
                match &err {
                    PipelineError::Domain { .. } => warn!(
                        queue,
                        message_type = %message_type,
                        file_path = ?file_path,
                        error = %err,
                        envelope = %envelope.to_json_value(),
                        "Stage failed"
                    ),
                    _ => error!(
                        queue,
                        message_type = %message_type,
                        file_path = ?file_path,
                        error = %err,
                        %disposition,
                        envelope = %envelope.to_json_value(),
                        "Message handling failed"
                    ),
                }
                self.events.emit_lossy(PipelineEvent::StageFailed {
                    queue: queue.to_string(),
                    message_type,
                    file_path,
                    reason: err.to_string(),
                    timestamp: Utc::now(),
                });
                disposition
            }
        }
    }
}
