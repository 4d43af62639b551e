//! Pulse consumer: AMQP session management around the dispatcher.
//!
//! 1. Connect to the broker and open one channel with prefetch 1
//! 2. Declare the durable, exclusive queue `queue/<login>/<name>`
//! 3. Bind it to every task exchange with every routing key
//! 4. Consume, handing each delivery to the dispatcher, which acks it

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use serde_json::json;
use uuid::Uuid;

use pulse_common::config::AppConfig;
use pulse_common::types::{Delivery, Envelope};
use pulse_engine::dispatcher::{AckError, Acknowledger, Dispatcher};

/// Task exchanges the queue is bound to.
pub const EXCHANGES: [&str; 3] = [
    "exchange/taskcluster-queue/v1/task-completed",
    "exchange/taskcluster-queue/v1/task-failed",
    "exchange/taskcluster-queue/v1/task-exception",
];

/// Acknowledges deliveries on the consuming channel.
pub struct ChannelAcker {
    channel: Channel,
}

#[async_trait]
impl Acknowledger for ChannelAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AckError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| AckError {
                delivery_tag,
                reason: e.to_string(),
            })
    }
}

/// A connected, bound consumer.
pub struct PulseConsumer {
    // kept alive for the lifetime of the channel
    _connection: Connection,
    channel: Channel,
    queue: String,
}

impl PulseConsumer {
    /// Connect, declare the queue and bind it.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        tracing::info!(broker = %config.amqp_uri_redacted(), "Connecting to Pulse");

        let connection = Connection::connect(
            &config.amqp_uri()?,
            ConnectionProperties::default().with_connection_name("pulse-notify".into()),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Pulse connection failed: {}", e))?;

        let channel = connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;

        let queue = config.queue_name();
        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue = %queue, "Queue declared");

        for exchange in EXCHANGES {
            for routing_key in &config.routing_keys {
                channel
                    .queue_bind(
                        &queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
                tracing::info!(queue = %queue, exchange, routing_key = %routing_key, "Queue bound");
            }
        }

        Ok(Self {
            _connection: connection,
            channel,
            queue,
        })
    }

    /// Consume until the broker closes the stream or fails.
    pub async fn run(&self, dispatcher: &Dispatcher) -> anyhow::Result<()> {
        let consumer_tag = format!("pulse-notify-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::info!(queue = %self.queue, consumer_tag = %consumer_tag, "Listening for messages");

        let acker = ChannelAcker {
            channel: self.channel.clone(),
        };

        while let Some(incoming) = consumer.next().await {
            let incoming = incoming.map_err(|e| anyhow::anyhow!("Pulse consumer failed: {}", e))?;
            let delivery = Delivery {
                envelope: envelope(
                    incoming.delivery_tag,
                    incoming.exchange.as_str(),
                    incoming.routing_key.as_str(),
                    &incoming.properties,
                ),
                body: incoming.data,
            };

            tracing::debug!(
                delivery_tag = delivery.envelope.delivery_tag,
                exchange = %delivery.envelope.exchange,
                routing_key = %delivery.envelope.routing_key,
                "Message received"
            );
            dispatcher.dispatch(&delivery, &acker).await;
        }

        tracing::warn!(queue = %self.queue, "Consumer stream closed by broker");
        Ok(())
    }
}

/// Broker metadata of one delivery. Properties keep only what is useful in
/// logs and notifications.
fn envelope(delivery_tag: u64, exchange: &str, routing_key: &str, properties: &BasicProperties) -> Envelope {
    Envelope {
        exchange: exchange.to_string(),
        routing_key: routing_key.to_string(),
        delivery_tag,
        properties: json!({
            "content_type": properties.content_type().as_ref().map(|s| s.as_str()),
            "content_encoding": properties.content_encoding().as_ref().map(|s| s.as_str()),
            "message_id": properties.message_id().as_ref().map(|s| s.as_str()),
            "timestamp": properties.timestamp(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_from_delivery() {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_timestamp(1_700_000_000);

        let envelope = envelope(
            3,
            "exchange/taskcluster-queue/v1/task-failed",
            "primary.abc.0",
            &properties,
        );

        assert_eq!(envelope.status(), "task-failed");
        assert_eq!(envelope.delivery_tag, 3);
        assert_eq!(envelope.routing_key, "primary.abc.0");
        assert_eq!(envelope.properties["content_type"], "application/json");
        assert_eq!(envelope.properties["timestamp"], 1_700_000_000);
        assert!(envelope.properties["message_id"].is_null());
    }

    #[test]
    fn test_every_task_status_exchange_bound() {
        let statuses: Vec<&str> = EXCHANGES
            .iter()
            .map(|e| e.rsplit('/').next().unwrap())
            .collect();
        assert_eq!(statuses, vec!["task-completed", "task-failed", "task-exception"]);
    }
}
