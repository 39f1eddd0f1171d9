//! Transport abstraction under the broker client
//!
//! A transport knows how to reach a broker and nothing about envelopes.
//! Each backend maps these primitives onto its own protocol.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Transport-level failures; all are recoverable by reconnecting
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Queue declaration failed for {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("Publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("Settling delivery {delivery_tag} failed: {reason}")]
    Settle { delivery_tag: u64, reason: String },

    #[error("Broker client is closed")]
    Closed,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Terminal action for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Done; remove from the queue
    Ack,
    /// Unprocessable; remove without requeue
    Reject,
    /// Transient failure; put back for redelivery
    Requeue,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Disposition::Ack => "ack",
            Disposition::Reject => "reject",
            Disposition::Requeue => "requeue",
        };
        f.write_str(name)
    }
}

/// Backend hook that settles one delivery
#[async_trait]
pub trait Acker: Send + Sync {
    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> TransportResult<()>;
}

/// A message received from a queue
///
/// `settle` consumes the delivery, so each delivery is acknowledged,
/// rejected or requeued exactly once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            delivery_tag,
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn settle(self, disposition: Disposition) -> TransportResult<()> {
        self.acker.settle(self.delivery_tag, disposition).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer
///
/// An `Err` item or the end of the stream means the consumer lost its
/// connection and must be re-established.
pub type DeliveryStream = BoxStream<'static, TransportResult<Delivery>>;

/// Connection-level operations a broker backend provides
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open (or replace) the connection and channel
    async fn connect(&self) -> TransportResult<()>;

    fn is_connected(&self) -> bool;

    /// Declare a durable queue
    async fn declare_queue(&self, queue: &str) -> TransportResult<()>;

    /// Publish a persistent message to a queue
    async fn publish(&self, queue: &str, payload: &[u8]) -> TransportResult<()>;

    /// Start consuming with at most `prefetch` unacknowledged deliveries
    async fn consume(&self, queue: &str, prefetch: u16) -> TransportResult<DeliveryStream>;

    async fn close(&self) -> TransportResult<()>;
}
