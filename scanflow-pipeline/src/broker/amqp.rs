//! RabbitMQ transport over AMQP 0-9-1
//!
//! One connection and one channel per transport, driven by the tokio
//! runtime that calls `connect`. Queues are declared durable, messages are
//! published persistent (delivery mode 2) with publisher confirms, and
//! prefetch is set with `basic.qos`.

use super::transport::{
    Acker, Delivery, DeliveryStream, Disposition, Transport, TransportError, TransportResult,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

const PERSISTENT: u8 = 2;

struct Session {
    connection: Connection,
    channel: Channel,
}

pub struct AmqpTransport {
    uri: String,
    session: RwLock<Option<Arc<Session>>>,
}

impl AmqpTransport {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            session: RwLock::new(None),
        }
    }

    fn session(&self) -> TransportResult<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn replace_session(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        let mut guard = self.session.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, session)
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self) -> TransportResult<()> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(&self.uri, properties)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let previous = self.replace_session(Some(Arc::new(Session {
            connection,
            channel,
        })));
        if let Some(old) = previous {
            if let Err(e) = old.connection.close(200, "reconnecting").await {
                debug!(error = %e, "Closing stale AMQP connection failed");
            }
        }
        info!("Connected to AMQP broker");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.session() {
            Ok(session) => {
                session.connection.status().connected() && session.channel.status().connected()
            }
            Err(_) => false,
        }
    }

    async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        let session = self.session()?;
        session
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> TransportResult<()> {
        let session = self.session()?;
        let publish_error = |reason: String| TransportError::Publish {
            queue: queue.to_string(),
            reason,
        };

        let confirmation = session
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(publish_error("broker nacked the message".to_string()));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> TransportResult<DeliveryStream> {
        let session = self.session()?;
        session
            .channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::ChannelClosed(e.to_string()))?;

        let consumer_tag = format!("scanflow-{}", uuid::Uuid::new_v4());
        let consumer = session
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::ChannelClosed(e.to_string()))?;
        debug!(queue, consumer_tag = %consumer_tag, prefetch, "AMQP consumer registered");

        let stream = consumer.map(|item| match item {
            Ok(delivery) => Ok(Delivery::new(
                delivery.delivery_tag,
                delivery.data,
                delivery.redelivered,
                Box::new(AmqpAcker {
                    acker: delivery.acker,
                }),
            )),
            Err(e) => Err(TransportError::ChannelClosed(e.to_string())),
        });
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> TransportResult<()> {
        if let Some(session) = self.replace_session(None) {
            if let Err(e) = session.connection.close(200, "shutdown").await {
                warn!(error = %e, "Error closing AMQP connection");
            }
        }
        Ok(())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn settle(&self, delivery_tag: u64, disposition: Disposition) -> TransportResult<()> {
        let result = match disposition {
            Disposition::Ack => self.acker.ack(BasicAckOptions::default()).await,
            Disposition::Reject => {
                self.acker
                    .reject(BasicRejectOptions { requeue: false })
                    .await
            }
            Disposition::Requeue => {
                self.acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
        };
        result.map(|_| ()).map_err(|e| TransportError::Settle {
            delivery_tag,
            reason: e.to_string(),
        })
    }
}
