//! Broker client
//!
//! Owns the transport, the set of declared queues, and one consume loop per
//! queue. Knows nothing about message contents: a consume loop hands raw
//! bytes to a [`DeliveryHandler`] and settles the delivery with whatever
//! disposition it returns.
//!
//! Recovery rules:
//! - `publish` on a failed transport reconnects once, then surfaces the error
//! - a consume loop that loses its stream reconnects with capped, jittered
//!   exponential backoff, re-declares every known queue, and resubscribes
//! - reconnect attempts are serialized one at a time, never across a
//!   backoff sleep; a loop that finds the transport already reconnected
//!   skips straight to resubscribing

pub mod backoff;
pub mod memory;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;

use crate::gate::AnalysisGate;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use scanflow_common::{ConsumerState, Envelope, EventBus, NotificationKind, Notifier, PipelineEvent, QueueNames};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use backoff::ReconnectPolicy;
pub use memory::InMemoryTransport;
pub use transport::{Acker, Delivery, DeliveryStream, Disposition, Transport, TransportError, TransportResult};

/// One unacknowledged message in flight per consumer
pub const PREFETCH: u16 = 1;

/// Decides what happens to each delivered message
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle_delivery(&self, queue: &str, payload: &[u8]) -> Disposition;
}

enum StreamEnd {
    Cancelled,
    Lost(String),
}

pub struct BrokerClient {
    transport: Arc<dyn Transport>,
    queues: QueueNames,
    policy: ReconnectPolicy,
    events: EventBus,
    declared: RwLock<BTreeSet<String>>,
    reconnect_lock: Mutex<()>,
    consumers: RwLock<BTreeMap<String, ConsumerState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl BrokerClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        queues: QueueNames,
        policy: ReconnectPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            transport,
            queues,
            policy,
            events,
            declared: RwLock::new(BTreeSet::new()),
            reconnect_lock: Mutex::new(()),
            consumers: RwLock::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    /// Physical name of a logical queue
    pub fn queue(&self, logical: &str) -> String {
        self.queues.physical(logical)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queues declared so far, in name order
    pub async fn declared_queues(&self) -> Vec<String> {
        self.declared.read().await.iter().cloned().collect()
    }

    pub async fn consumer_states(&self) -> Vec<(String, ConsumerState)> {
        self.consumers
            .read()
            .await
            .iter()
            .map(|(queue, state)| (queue.clone(), *state))
            .collect()
    }

    /// Connect, retrying with backoff until connected or closed
    pub async fn connect(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.recover().await {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Declare a durable queue and remember it for re-declaration
    pub async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        self.transport.declare_queue(queue).await?;
        let newly_added = self.declared.write().await.insert(queue.to_string());
        if newly_added {
            debug!(queue, "Declared queue");
        }
        Ok(())
    }

    /// Publish an envelope to a physical queue
    ///
    /// On failure the client reconnects exactly once and retries; a second
    /// failure is returned to the caller.
    pub async fn publish(&self, queue: &str, envelope: &Envelope) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let payload = envelope.encode();

        match self.try_publish(queue, &payload).await {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(
                    queue,
                    message_type = envelope.message_type(),
                    error = %first,
                    "Publish failed, reconnecting once"
                );
                self.reconnect_once().await?;
                self.try_publish(queue, &payload).await
            }
        }
    }

    async fn try_publish(&self, queue: &str, payload: &[u8]) -> TransportResult<()> {
        let known = self.declared.read().await.contains(queue);
        if !known {
            self.declare_queue(queue).await?;
        }
        self.transport.publish(queue, payload).await
    }

    /// Start a consume loop for `queue`
    ///
    /// When `gate` is given, the loop does not take the next delivery while
    /// the gate is closed.
    pub async fn consume(
        self: &Arc<Self>,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        gate: Option<AnalysisGate>,
    ) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.declare_queue(queue).await?;
        self.set_consumer_state(queue, ConsumerState::Starting).await;

        let client = Arc::clone(self);
        let queue = queue.to_string();
        let handle = tokio::spawn(async move {
            client.run_consumer(queue, handler, gate).await;
        });
        self.tasks.lock().await.push(handle);
        Ok(())
    }

    /// Stop all consume loops (each finishes its current message) and close
    /// the transport
    pub async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing broker client");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Consumer task ended abnormally");
            }
        }
        self.transport.close().await
    }

    async fn run_consumer(
        self: Arc<Self>,
        queue: String,
        handler: Arc<dyn DeliveryHandler>,
        gate: Option<AnalysisGate>,
    ) {
        let mut failures: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if failures > 1 {
                let delay = self.policy.delay_for_attempt(failures - 2);
                debug!(queue = %queue, delay_ms = delay.as_millis() as u64, "Delaying resubscribe");
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let stream = match self.transport.consume(&queue, PREFETCH).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to start consumer");
                    failures = failures.saturating_add(1);
                    self.set_consumer_state(&queue, ConsumerState::Reconnecting).await;
                    if !self.recover().await {
                        break;
                    }
                    continue;
                }
            };

            info!(queue = %queue, prefetch = PREFETCH, "Consumer started");
            self.set_consumer_state(&queue, ConsumerState::Running).await;

            match self.drain(&queue, stream, &handler, gate.as_ref(), &mut failures).await {
                StreamEnd::Cancelled => break,
                StreamEnd::Lost(reason) => {
                    warn!(queue = %queue, reason = %reason, "Consumer lost broker connection");
                    failures = failures.saturating_add(1);
                    self.set_consumer_state(&queue, ConsumerState::Reconnecting).await;
                    if !self.recover().await {
                        break;
                    }
                }
            }
        }

        self.set_consumer_state(&queue, ConsumerState::Stopped).await;
        info!(queue = %queue, "Consumer stopped");
    }

    async fn drain(
        &self,
        queue: &str,
        mut stream: DeliveryStream,
        handler: &Arc<dyn DeliveryHandler>,
        gate: Option<&AnalysisGate>,
        failures: &mut u32,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    *failures = 0;
                    // The prefetched delivery waits here, unsettled, while paused
                    if let Some(gate) = gate {
                        if !self.wait_for_gate(queue, gate).await {
                            return StreamEnd::Cancelled;
                        }
                    }
                    self.process(queue, delivery, handler).await;
                }
                Some(Err(e)) => return StreamEnd::Lost(e.to_string()),
                None => return StreamEnd::Lost("consumer stream ended".to_string()),
            }
        }
    }

    /// Block while the gate is closed; false when shut down first
    async fn wait_for_gate(&self, queue: &str, gate: &AnalysisGate) -> bool {
        if gate.is_open() {
            return true;
        }
        self.set_consumer_state(queue, ConsumerState::Paused).await;
        info!(queue, "Consumer paused");
        tokio::select! {
            _ = self.shutdown.cancelled() => return false,
            _ = gate.wait_open() => {}
        }
        info!(queue, "Consumer resumed");
        self.set_consumer_state(queue, ConsumerState::Running).await;
        true
    }

    async fn process(&self, queue: &str, delivery: Delivery, handler: &Arc<dyn DeliveryHandler>) {
        let delivery_tag = delivery.delivery_tag;
        if delivery.redelivered {
            debug!(queue, delivery_tag, "Processing redelivered message");
        }

        let disposition = handler.handle_delivery(queue, &delivery.payload).await;

        match delivery.settle(disposition).await {
            Ok(()) => {
                debug!(queue, delivery_tag, %disposition, "Delivery settled");
                self.events.emit_lossy(PipelineEvent::MessageDisposed {
                    queue: queue.to_string(),
                    delivery_tag,
                    disposition: disposition.to_string(),
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                // The broker redelivers unsettled messages after reconnect
                warn!(queue, delivery_tag, %disposition, error = %e, "Failed to settle delivery");
            }
        }
    }

    /// Reconnect once for `publish`, unless another task already did
    async fn reconnect_once(&self) -> TransportResult<()> {
        if self.reconnect_attempt().await? {
            info!("Reconnected to broker");
        }
        Ok(())
    }

    /// One serialized connect-and-redeclare attempt
    ///
    /// The lock covers a single attempt only, so a publish never queues
    /// behind another task's backoff sleep. Returns false when the
    /// transport was already connected.
    async fn reconnect_attempt(&self) -> TransportResult<bool> {
        let _guard = self.reconnect_lock.lock().await;
        if self.transport.is_connected() {
            return Ok(false);
        }
        self.transport.connect().await?;
        self.redeclare_all().await?;
        Ok(true)
    }

    /// Reconnect with backoff until connected; false when shut down first
    async fn recover(&self) -> bool {
        let mut attempt: u32 = 0;
        let mut alerted = false;
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }

            match self.reconnect_attempt().await {
                Ok(_) => {
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Reconnected to broker");
                    }
                    if alerted {
                        self.events
                            .notify(NotificationKind::Info, "Broker connection restored");
                    }
                    return true;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if attempt >= self.policy.alert_after_attempts && !alerted {
                        error!(
                            attempts = attempt,
                            error = %e,
                            "Broker still unreachable, continuing at maximum backoff"
                        );
                        self.events.notify(
                            NotificationKind::Error,
                            &format!("Broker unreachable after {} attempts: {}", attempt, e),
                        );
                        alerted = true;
                    }

                    let delay = self.policy.delay_for_attempt(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker reconnect failed, backing off"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn redeclare_all(&self) -> TransportResult<()> {
        let queues: Vec<String> = self.declared.read().await.iter().cloned().collect();
        for queue in &queues {
            self.transport.declare_queue(queue).await?;
        }
        if !queues.is_empty() {
            debug!(count = queues.len(), "Re-declared queues");
        }
        Ok(())
    }

    async fn set_consumer_state(&self, queue: &str, state: ConsumerState) {
        let previous = self.consumers.write().await.insert(queue.to_string(), state);
        if previous != Some(state) {
            self.events.emit_lossy(PipelineEvent::ConsumerStateChanged {
                queue: queue.to_string(),
                state,
                timestamp: Utc::now(),
            });
        }
    }
}
