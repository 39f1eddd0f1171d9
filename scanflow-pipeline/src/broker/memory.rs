//! In-process broker backend
//!
//! Gives durable-queue semantics inside one process: FIFO per queue,
//! prefetch accounting per consumer, and unacknowledged messages returned
//! to the head of their queue when the connection drops. It also keeps a
//! ledger of every settlement and declaration, and can inject connection
//! faults, which is what the broker tests assert against.

use super::transport::{
    Acker, Delivery, DeliveryStream, Disposition, Transport, TransportError, TransportResult,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct State {
    connected: bool,
    /// Bumped on every disconnect; consumers from older generations end
    generation: u64,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    unacked: BTreeMap<u64, Unacked>,
    in_flight: HashMap<u64, usize>,
    next_tag: u64,
    next_consumer: u64,
    failing_connects: u32,
    connect_attempts: u32,
    declarations: Vec<String>,
    subscriptions: Vec<(String, u16)>,
    published: Vec<(String, Vec<u8>)>,
    settlements: Vec<(u64, Disposition)>,
    dead_letters: Vec<(String, Vec<u8>)>,
}

impl State {
    /// Return every unacknowledged message to the head of its queue
    fn requeue_unacked(&mut self) {
        let unacked = std::mem::take(&mut self.unacked);
        for (_, entry) in unacked.into_iter().rev() {
            let mut message = entry.message;
            message.redelivered = true;
            self.queues.entry(entry.queue).or_default().push_front(message);
        }
        self.in_flight.clear();
    }
}

/// Broker backend living entirely in process memory
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate losing the broker connection
    pub fn drop_connection(&self) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.generation += 1;
            state.requeue_unacked();
        }
        self.notify.notify_waiters();
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Number of times `connect` was called
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Every queue declaration, in call order
    pub fn declarations(&self) -> Vec<String> {
        self.lock().declarations.clone()
    }

    /// Every `(queue, prefetch)` consumer subscription, in call order
    pub fn subscriptions(&self) -> Vec<(String, u16)> {
        self.lock().subscriptions.clone()
    }

    /// Payloads published to `queue`, in publish order
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Every `(delivery_tag, disposition)` settlement, in call order
    pub fn settlements(&self) -> Vec<(u64, Disposition)> {
        self.lock().settlements.clone()
    }

    /// Messages rejected without requeue
    pub fn dead_letters(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().dead_letters.clone()
    }

    /// Messages waiting in `queue` (not counting in-flight deliveries)
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Deliveries handed out but not yet settled
    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    fn next_delivery(
        &self,
        queue: &str,
        consumer_id: u64,
        generation: u64,
        prefetch: u16,
    ) -> Step {
        let mut state = self.lock();
        if !state.connected || state.generation != generation {
            return Step::Lost;
        }
        let in_flight = state.in_flight.get(&consumer_id).copied().unwrap_or(0);
        if prefetch > 0 && in_flight >= prefetch as usize {
            return Step::Wait;
        }
        let Some(message) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Step::Wait;
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        *state.in_flight.entry(consumer_id).or_default() += 1;
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                consumer_id,
                message: message.clone(),
            },
        );

        let acker = MemoryAcker {
            transport: self.clone(),
        };
        Step::Deliver(Delivery::new(
            tag,
            message.payload,
            message.redelivered,
            Box::new(acker),
        ))
    }
}

enum Step {
    Deliver(Delivery),
    Wait,
    Lost,
}

struct MemoryAcker {
    transport: InMemoryTransport,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> TransportResult<()> {
        {
            let mut state = self.transport.lock();
            // Unknown tags were requeued by a disconnect; AMQP fails the same way
            let entry = state
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| TransportError::Settle {
                    delivery_tag,
                    reason: "unknown delivery tag (channel was reset)".to_string(),
                })?;
            if let Some(count) = state.in_flight.get_mut(&entry.consumer_id) {
                *count = count.saturating_sub(1);
            }
            state.settlements.push((delivery_tag, disposition));

            match disposition {
                Disposition::Ack => {}
                Disposition::Reject => {
                    state
                        .dead_letters
                        .push((entry.queue, entry.message.payload));
                }
                Disposition::Requeue => {
                    let mut message = entry.message;
                    message.redelivered = true;
                    state.queues.entry(entry.queue).or_default().push_front(message);
                }
            }
        }
        self.transport.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> TransportResult<()> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::Connect(
                "injected connection failure".to_string(),
            ));
        }
        state.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.declarations.push(queue.to_string());
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> TransportResult<()> {
        {
            let mut state = self.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.published.push((queue.to_string(), payload.to_vec()));
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(StoredMessage {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> TransportResult<DeliveryStream> {
        let (consumer_id, generation) = {
            let mut state = self.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.subscriptions.push((queue.to_string(), prefetch));
            state.next_consumer += 1;
            (state.next_consumer, state.generation)
        };

        let transport = self.clone();
        let queue = queue.to_string();
        let stream = async_stream::stream! {
            loop {
                let notify = transport.notify.clone();
                // Registered before checking so a concurrent publish is not missed
                let notified = notify.notified();
                match transport.next_delivery(&queue, consumer_id, generation, prefetch) {
                    Step::Deliver(delivery) => yield Ok(delivery),
                    Step::Wait => notified.await,
                    Step::Lost => {
                        yield Err(TransportError::ChannelClosed(format!(
                            "connection to in-memory broker lost while consuming {}",
                            queue
                        )));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> TransportResult<()> {
        {
            let mut state = self.lock();
            state.connected = false;
            state.generation += 1;
            state.requeue_unacked();
        }
        self.notify.notify_waiters();
        Ok(())
    }
}
