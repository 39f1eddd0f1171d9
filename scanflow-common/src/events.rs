//! In-process pipeline events
//!
//! The event bus is a tokio broadcast channel. Stages emit what happened to
//! each message; the binary subscribes a log sink for operator
//! notifications and the health endpoint tracks the last failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of an operator notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
}

/// Lifecycle of a queue consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Starting,
    Running,
    Paused,
    Reconnecting,
    Stopped,
}

/// Events broadcast by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A message was handled successfully
    StageCompleted {
        queue: String,
        message_type: String,
        file_path: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A handler failed for a message
    StageFailed {
        queue: String,
        message_type: String,
        file_path: Option<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The broker delivery was settled
    MessageDisposed {
        queue: String,
        delivery_tag: u64,
        disposition: String,
        timestamp: DateTime<Utc>,
    },

    /// A consumer changed state
    ConsumerStateChanged {
        queue: String,
        state: ConsumerState,
        timestamp: DateTime<Utc>,
    },

    /// The prediction model was replaced
    ModelSwapped {
        source: String,
        labels: usize,
        timestamp: DateTime<Utc>,
    },

    /// Something an operator should see
    Notification {
        kind: NotificationKind,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Outbound channel for operator-facing messages
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NotificationKind, message: &str);
}

/// Broadcast bus for [`PipelineEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, failing when nobody is subscribed
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PipelineEvent,
    ) -> Result<usize, broadcast::error::SendError<PipelineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the absence of subscribers
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Notifier for EventBus {
    fn notify(&self, kind: NotificationKind, message: &str) {
        self.emit_lossy(PipelineEvent::Notification {
            kind,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}
